use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};

use crate::config::model::{EventConfig, ModuleConfig, PageConfig};
use crate::config::wire;
use crate::config::PageFilter;
use crate::protocol::{
    self, Filter, Instruction, MessageDescriptor, Value, CONFIG_LENGTH, PROTOCOL_VERSION,
};
use crate::serial::{Link, LinkEvent};

use super::types::{self, FirmwareVersion, ModuleInfo};
use super::{Correlator, DeviceError, Result};

const MODULE_POLL: Duration = Duration::from_millis(100);
const LATE_HEARTBEAT_WINDOW: Duration = Duration::from_millis(500);
const EDITOR_HEARTBEAT_PERIOD: Duration = Duration::from_millis(300);
const EVENT_PACING: Duration = Duration::from_millis(30);

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_TIMEOUT: Duration = Duration::from_millis(1500);
const STORE_TIMEOUT: Duration = Duration::from_secs(10);
const ERASE_TIMEOUT: Duration = Duration::from_secs(15);

const PAGE_CHANGE_DISABLED_MARKER: &str = "page change is disabled";

/// Handle to one connected Grid chain.
///
/// Owns the module inventory synthesized from heartbeat traffic, runs the
/// periodic editor ping that keeps the host in the device's active-editor
/// set, and drives the configuration transfer loops with their retry and
/// page-switch policies.
pub struct Device {
    link: Arc<Link>,
    correlator: Arc<Correlator>,
    modules: Arc<Mutex<HashMap<(i8, i8), ModuleInfo>>>,
    page_change_disabled: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    active_page: Mutex<Option<u8>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Attach to an open link: subscribe the dispatcher and start the
    /// editor heartbeat.
    pub fn new(link: Arc<Link>) -> Self {
        let correlator = Arc::new(Correlator::new());
        let modules = Arc::new(Mutex::new(HashMap::new()));
        let page_change_disabled = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let dispatch_task = tokio::spawn(dispatch_task(
            link.subscribe(),
            correlator.clone(),
            modules.clone(),
            page_change_disabled.clone(),
            closing.clone(),
        ));
        let heartbeat_task = tokio::spawn(editor_heartbeat_task(link.clone(), closing.clone()));

        Self {
            link,
            correlator,
            modules,
            page_change_disabled,
            closing,
            active_page: Mutex::new(None),
            dispatch_task: Mutex::new(Some(dispatch_task)),
            heartbeat_task: Mutex::new(Some(heartbeat_task)),
        }
    }

    /// Snapshot of the discovered modules, ordered by position.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut modules: Vec<ModuleInfo> = self.lock_modules().values().cloned().collect();
        modules.sort_by_key(|m| (m.dx, m.dy));
        modules
    }

    /// Poll the inventory for up to `budget`; once the first module shows
    /// up, absorb a short window for late heartbeats (never exceeding the
    /// budget). Never fails — an empty chain returns an empty snapshot.
    pub async fn wait_for_modules(&self, budget: Duration) -> Vec<ModuleInfo> {
        let deadline = Instant::now() + budget;

        while self.lock_modules().is_empty() {
            if Instant::now() >= deadline {
                return Vec::new();
            }
            sleep(MODULE_POLL.min(deadline - Instant::now())).await;
        }

        let tail = LATE_HEARTBEAT_WINDOW.min(deadline.saturating_duration_since(Instant::now()));
        sleep(tail).await;
        self.modules()
    }

    /// Fetch one event binding.
    ///
    /// The second value reports a communication failure (timeout past the
    /// retry budget, or a reply without a usable `ACTIONSTRING`), which the
    /// module transfer loop counts separately from genuinely empty
    /// bindings.
    pub async fn fetch_event_config(
        &self,
        dx: i8,
        dy: i8,
        page: u8,
        element: u8,
        event_type: u8,
    ) -> Result<(Vec<crate::config::Action>, bool)> {
        let descriptor = MessageDescriptor::new(dx, dy, "CONFIG", Instruction::Fetch)
            .param("VERSIONMAJOR", PROTOCOL_VERSION.0)
            .param("VERSIONMINOR", PROTOCOL_VERSION.1)
            .param("VERSIONPATCH", PROTOCOL_VERSION.2)
            .param("PAGENUMBER", page)
            .param("ELEMENTNUMBER", element)
            .param("EVENTTYPE", event_type)
            .param("ACTIONLENGTH", 0u8);
        let filter = Filter::class("CONFIG")
            .instruction(Instruction::Report)
            .source(dx, dy)
            .param("PAGENUMBER", page)
            .param("ELEMENTNUMBER", element)
            .param("EVENTTYPE", event_type);

        let reply = match self
            .request_with_retry(&descriptor, filter, FETCH_TIMEOUT, 2)
            .await
        {
            Ok(reply) => reply,
            Err(DeviceError::Timeout) => {
                log::warn!(
                    "Fetch timed out for ({},{}) page {} element {} event {}",
                    dx,
                    dy,
                    page,
                    element,
                    event_type
                );
                return Ok((Vec::new(), true));
            }
            Err(e) => return Err(e),
        };

        let action_string = match reply.param("ACTIONSTRING").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => {
                log::warn!(
                    "CONFIG report for ({},{}) page {} element {} event {} carries no action string",
                    dx,
                    dy,
                    page,
                    element,
                    event_type
                );
                return Ok((Vec::new(), true));
            }
        };

        let unwrapped = match wire::unwrap_actionstring(&action_string) {
            Some(inner) => inner,
            None => {
                log::warn!("Action string is missing its <?lua ?> wrapper");
                return Ok((Vec::new(), true));
            }
        };
        match wire::parse_actions(unwrapped) {
            Ok(actions) => Ok((actions, false)),
            Err(e) => {
                log::warn!("Unparsable action string: {}", e);
                Ok((Vec::new(), true))
            }
        }
    }

    /// Fetch every event binding of `module` across the filtered pages.
    ///
    /// `progress` receives a non-decreasing `(done, total)` pair after each
    /// event. Aborts with `ProtocolUnstable` when communication failures
    /// exceed `max(5, 10%)` of the total.
    pub async fn fetch_module_config(
        &self,
        module: &ModuleInfo,
        pages: &PageFilter,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<ModuleConfig> {
        let page_numbers = pages.pages();
        let per_page: usize = module
            .elements
            .iter()
            .map(|e| e.element_type.supported_events().len())
            .sum();
        let total = per_page * page_numbers.len();
        let threshold = 5usize.max(total / 10);

        let mut done = 0usize;
        let mut failed = 0usize;
        let mut page_configs = Vec::new();

        for &page in &page_numbers {
            let mut events = Vec::new();
            for entry in &module.elements {
                for &event in entry.element_type.supported_events() {
                    let (actions, fetch_failed) = self
                        .fetch_event_config(
                            module.dx,
                            module.dy,
                            page,
                            entry.index,
                            event.code(),
                        )
                        .await?;
                    if fetch_failed {
                        failed += 1;
                        if failed > threshold {
                            return Err(DeviceError::ProtocolUnstable { failed, total });
                        }
                    }
                    events.push(EventConfig {
                        element: entry.index,
                        event,
                        actions,
                    });
                    done += 1;
                    progress(done, total);
                }
            }
            page_configs.push(PageConfig {
                number: page,
                events,
            });
        }

        Ok(ModuleConfig {
            module: module.clone(),
            pages: page_configs,
        })
    }

    /// Send one event binding and await the device acknowledgement.
    pub async fn send_event_config(
        &self,
        dx: i8,
        dy: i8,
        page: u8,
        element: u8,
        event_type: u8,
        actions: &[crate::config::Action],
    ) -> Result<()> {
        let wrapped = wire::wrap_actionstring(&wire::serialize_actions(actions));
        if wrapped.len() > CONFIG_LENGTH {
            return Err(DeviceError::ConfigTooLong {
                len: wrapped.len(),
                max: CONFIG_LENGTH,
            });
        }

        let descriptor = MessageDescriptor::new(dx, dy, "CONFIG", Instruction::Execute)
            .param("VERSIONMAJOR", PROTOCOL_VERSION.0)
            .param("VERSIONMINOR", PROTOCOL_VERSION.1)
            .param("VERSIONPATCH", PROTOCOL_VERSION.2)
            .param("PAGENUMBER", page)
            .param("ELEMENTNUMBER", element)
            .param("EVENTTYPE", event_type)
            .param("ACTIONLENGTH", wrapped.len())
            .param("ACTIONSTRING", wrapped.as_str());
        let filter = Filter::class("CONFIG")
            .instruction(Instruction::Acknowledge)
            .source(dx, dy);

        self.request_with_retry(&descriptor, filter, EXECUTE_TIMEOUT, 3)
            .await?;
        Ok(())
    }

    /// Push a whole module configuration, page by page.
    ///
    /// Every page switch is confirmed before that page's EXECUTEs are
    /// issued, with a short pacing delay between events as firmware
    /// back-pressure. `target` overrides the addressing position for
    /// push-by-position onto a different physical chain.
    pub async fn send_module_config(
        &self,
        config: &ModuleConfig,
        target: Option<&ModuleInfo>,
    ) -> Result<()> {
        let addressed = target.unwrap_or(&config.module);
        let (dx, dy) = addressed.position();

        for page in &config.pages {
            let active = *self.lock_active_page();
            if active != Some(page.number) {
                if !self.change_page(page.number, Some(addressed)).await? {
                    return Err(DeviceError::PageChangeFailed(page.number));
                }
            }

            for (i, event) in page.events.iter().enumerate() {
                if i > 0 {
                    sleep(EVENT_PACING).await;
                }
                self.send_event_config(
                    dx,
                    dy,
                    page.number,
                    event.element,
                    event.event.code(),
                    &event.actions,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Switch the chain's active page, confirming via PAGEACTIVE reports.
    ///
    /// Two rounds, each trying the broadcast address and then (when a
    /// module is given) the module-scoped address. Returns whether any
    /// attempt confirmed; the caller decides fatality.
    pub async fn change_page(&self, page: u8, module: Option<&ModuleInfo>) -> Result<bool> {
        if self.page_change_disabled.load(Ordering::SeqCst) && page > 0 {
            // storing clears the device-side lock; keep the latch until
            // the store is confirmed
            if let Err(e) = self.store_to_flash().await {
                log::warn!("Store before page change failed: {}", e);
            }
        }

        let mut addressings: Vec<(i8, i8)> = vec![protocol::BROADCAST];
        if let Some(module) = module {
            addressings.push(module.position());
        }

        for round in 0..2 {
            for &(dx, dy) in &addressings {
                let descriptor = MessageDescriptor::new(dx, dy, "PAGEACTIVE", Instruction::Execute)
                    .param("PAGENUMBER", page);
                let filter = Filter::class("PAGEACTIVE")
                    .instruction(Instruction::Report)
                    .param("PAGENUMBER", page);

                match self.request_once(&descriptor, filter, PAGE_TIMEOUT).await {
                    Ok(_) => {
                        *self.lock_active_page() = Some(page);
                        return Ok(true);
                    }
                    Err(DeviceError::Timeout) => {
                        log::debug!(
                            "Page {} not confirmed via ({},{}) in round {}",
                            page,
                            dx,
                            dy,
                            round
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(false)
    }

    /// Persist the active configuration to device flash.
    pub async fn store_to_flash(&self) -> Result<()> {
        let descriptor = MessageDescriptor::broadcast("PAGESTORE", Instruction::Execute);
        let filter = Filter::class("PAGESTORE").instruction(Instruction::Acknowledge);
        self.request_with_retry(&descriptor, filter, STORE_TIMEOUT, 2)
            .await?;
        self.page_change_disabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Erase device non-volatile memory. A timeout surfaces without retry.
    pub async fn erase_nvm(&self) -> Result<()> {
        let descriptor = MessageDescriptor::broadcast("NVMERASE", Instruction::Execute);
        let filter = Filter::class("NVMERASE").instruction(Instruction::Acknowledge);
        self.request_once(&descriptor, filter, ERASE_TIMEOUT).await?;
        Ok(())
    }

    /// Shut down: stop the editor ping, cancel every pending waiter with
    /// `Cancelled`, and close the link. Never fails; errors are logged.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.lock_task(&self.heartbeat_task) {
            handle.abort();
        }
        self.correlator.cancel_all();
        self.link.close().await;
        if let Some(handle) = self.lock_task(&self.dispatch_task) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::warn!("Dispatch task ended abnormally: {}", e);
                }
            }
        }
    }

    async fn request_once(
        &self,
        descriptor: &MessageDescriptor,
        filter: Filter,
        budget: Duration,
    ) -> Result<crate::protocol::DecodedMessage> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(DeviceError::Cancelled);
        }
        let packet = protocol::codec()?.encode_packet(descriptor)?;
        // register before writing so a fast reply cannot slip past
        let pending = self.correlator.register(filter);
        if let Err(e) = self.link.write(&packet).await {
            self.correlator.deregister(pending.id());
            if self.closing.load(Ordering::SeqCst) {
                return Err(DeviceError::Cancelled);
            }
            return Err(e.into());
        }
        self.correlator.resolve(pending, budget).await
    }

    async fn request_with_retry(
        &self,
        descriptor: &MessageDescriptor,
        filter: Filter,
        budget: Duration,
        attempts: usize,
    ) -> Result<crate::protocol::DecodedMessage> {
        let mut last = DeviceError::Timeout;
        for attempt in 1..=attempts {
            match self.request_once(descriptor, filter.clone(), budget).await {
                Ok(reply) => return Ok(reply),
                Err(DeviceError::Timeout) => {
                    log::debug!(
                        "{} {} attempt {}/{} timed out",
                        descriptor.class,
                        descriptor.instruction.as_str(),
                        attempt,
                        attempts
                    );
                    last = DeviceError::Timeout;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn lock_modules(&self) -> std::sync::MutexGuard<'_, HashMap<(i8, i8), ModuleInfo>> {
        self.modules.lock().expect("module map lock poisoned")
    }

    fn lock_active_page(&self) -> std::sync::MutexGuard<'_, Option<u8>> {
        self.active_page.lock().expect("active page lock poisoned")
    }

    fn lock_task(&self, slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
        slot.lock().expect("task slot lock poisoned").take()
    }
}

async fn dispatch_task(
    mut events: broadcast::Receiver<LinkEvent>,
    correlator: Arc<Correlator>,
    modules: Arc<Mutex<HashMap<(i8, i8), ModuleInfo>>>,
    page_change_disabled: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Message(msg)) => {
                if closing.load(Ordering::SeqCst) {
                    continue;
                }
                if msg.class == "HEARTBEAT" && msg.instruction == Instruction::Report {
                    ingest_heartbeat(&msg, &modules);
                } else if msg.class == "DEBUGTEXT" {
                    if let Some(text) = msg.param("TEXT").and_then(Value::as_str) {
                        if text.contains(PAGE_CHANGE_DISABLED_MARKER) {
                            log::info!("Device reports page change disabled");
                            page_change_disabled.store(true, Ordering::SeqCst);
                        }
                    }
                }
                correlator.dispatch(&msg);
            }
            Ok(LinkEvent::Error(e)) => log::warn!("Link error: {}", e),
            Ok(LinkEvent::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Dispatcher lagged, {} messages dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    correlator.cancel_all();
}

fn ingest_heartbeat(
    msg: &crate::protocol::DecodedMessage,
    modules: &Arc<Mutex<HashMap<(i8, i8), ModuleInfo>>>,
) {
    // a heartbeat without numeric coordinates or hardware id is noise
    let (sx, sy, hwcfg) = match (
        msg.brc_int("SX"),
        msg.brc_int("SY"),
        msg.param_int("HWCFG"),
    ) {
        (Some(sx), Some(sy), Some(hwcfg)) => (sx, sy, hwcfg),
        _ => return,
    };
    if !(protocol::POSITION_MIN as i64..=protocol::POSITION_MAX as i64).contains(&sx)
        || !(protocol::POSITION_MIN as i64..=protocol::POSITION_MAX as i64).contains(&sy)
        || !(0..=255).contains(&hwcfg)
    {
        return;
    }
    let (dx, dy, hwcfg) = (sx as i8, sy as i8, hwcfg as u8);

    let firmware = FirmwareVersion {
        major: msg.param_int("VMAJOR").unwrap_or(0) as u32,
        minor: msg.param_int("VMINOR").unwrap_or(0) as u32,
        patch: msg.param_int("VPATCH").unwrap_or(0) as u32,
    };
    let type_name = types::module_type_name(hwcfg);

    let mut map = modules.lock().expect("module map lock poisoned");
    map.entry((dx, dy)).or_insert_with(|| {
        log::info!(
            "Discovered {} at ({},{}) firmware {}.{}.{}",
            type_name,
            dx,
            dy,
            firmware.major,
            firmware.minor,
            firmware.patch
        );
        ModuleInfo {
            dx,
            dy,
            elements: types::elements_for_type(&type_name),
            type_name,
            type_id: hwcfg,
            firmware,
        }
    });
}

async fn editor_heartbeat_task(link: Arc<Link>, closing: Arc<AtomicBool>) {
    let mut tick = interval(EDITOR_HEARTBEAT_PERIOD);
    loop {
        tick.tick().await;
        if closing.load(Ordering::SeqCst) || link.is_closed() {
            break;
        }
        let descriptor =
            MessageDescriptor::broadcast("HEARTBEAT", Instruction::Execute).param("TYPE", 255i64);
        let packet = match protocol::codec().and_then(|c| c.encode_packet(&descriptor)) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Editor heartbeat skipped: {}", e);
                continue;
            }
        };
        if let Err(e) = link.write(&packet).await {
            log::debug!("Editor heartbeat failed: {}", e);
        }
    }
}
