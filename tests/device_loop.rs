//! Device operations against a scripted loopback device: inventory
//! synthesis, retry behavior, page switching, and cancellation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gridctl::config::{Action, PageFilter};
use gridctl::device::types::{ElementEntry, ElementType, FirmwareVersion};
use gridctl::device::{Device, DeviceError, ModuleInfo};
use gridctl::protocol::Instruction;
use gridctl::serial::{Link, SerialError};

use common::{
    ack_frame, config_report, heartbeat_frame, init_codec, loopback, spawn_device,
};

fn test_module() -> ModuleInfo {
    ModuleInfo {
        dx: 0,
        dy: 0,
        type_name: "TEST".to_string(),
        type_id: 99,
        firmware: FirmwareVersion::default(),
        elements: vec![
            ElementEntry {
                index: 0,
                element_type: ElementType::Button,
            },
            ElementEntry {
                index: 1,
                element_type: ElementType::Button,
            },
        ],
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeats_populate_the_inventory() {
    init_codec();
    let (transport, end) = loopback();

    end.to_host
        .send(heartbeat_frame("0", "0", "1", ("1", "2", "3")))
        .unwrap();
    end.to_host
        .send(heartbeat_frame("1", "0", "0", ("2", "0", "5")))
        .unwrap();
    // a heartbeat with a non-numeric coordinate is dropped silently
    end.to_host
        .send(heartbeat_frame("x", "0", "1", ("1", "0", "0")))
        .unwrap();

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let modules = device.wait_for_modules(Duration::from_secs(3)).await;
    assert_eq!(modules.len(), 2);

    let bu16 = modules.iter().find(|m| m.position() == (0, 0)).unwrap();
    assert_eq!(bu16.type_name, "BU16");
    assert_eq!(
        (bu16.firmware.major, bu16.firmware.minor, bu16.firmware.patch),
        (1, 2, 3)
    );
    let po16 = modules.iter().find(|m| m.position() == (1, 0)).unwrap();
    assert_eq!(po16.type_name, "PO16");
    assert_eq!(
        (po16.firmware.major, po16.firmware.minor, po16.firmware.patch),
        (2, 0, 5)
    );
    assert_eq!(bu16.element_count(), 17); // 16 buttons + system element

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn empty_chain_returns_an_empty_snapshot() {
    init_codec();
    let (transport, _end) = loopback();
    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let modules = device.wait_for_modules(Duration::from_millis(400)).await;
    assert!(modules.is_empty());
    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_times_out_once_then_succeeds() {
    init_codec();
    let (transport, end) = loopback();

    let fetches = Arc::new(AtomicUsize::new(0));
    let seen = fetches.clone();
    let _device_task = spawn_device(end, move |msg| {
        if msg.class == "CONFIG" && msg.instruction == Instruction::Fetch {
            // swallow the first request, answer the retry
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return vec![];
            }
            return vec![config_report(&msg, "--[[@l]] local n = 1")];
        }
        vec![]
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let (actions, failed) = device.fetch_event_config(0, 0, 0, 0, 0).await.unwrap();
    assert!(!failed);
    assert_eq!(actions, vec![Action::new("l", None, "local n = 1")]);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_past_the_retry_budget_reports_failure() {
    init_codec();
    let (transport, end) = loopback();
    let _device_task = spawn_device(end, |_| vec![]);

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let (actions, failed) = device.fetch_event_config(0, 0, 0, 0, 0).await.unwrap();
    assert!(failed);
    assert!(actions.is_empty());

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn send_event_config_retries_twice_then_surfaces_timeout() {
    init_codec();
    let (transport, end) = loopback();

    let executes = Arc::new(AtomicUsize::new(0));
    let seen = executes.clone();
    let _device_task = spawn_device(end, move |msg| {
        if msg.class == "CONFIG" && msg.instruction == Instruction::Execute {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        vec![]
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let actions = vec![Action::new("l", None, "local n = 1")];
    let result = device.send_event_config(0, 0, 0, 0, 0, &actions).await;
    assert!(matches!(result, Err(DeviceError::Timeout)));
    assert_eq!(executes.load(Ordering::SeqCst), 3);

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn send_event_config_succeeds_on_a_late_acknowledge() {
    init_codec();
    let (transport, end) = loopback();

    let executes = Arc::new(AtomicUsize::new(0));
    let seen = executes.clone();
    let _device_task = spawn_device(end, move |msg| {
        if msg.class == "CONFIG" && msg.instruction == Instruction::Execute {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                return vec![];
            }
            return vec![ack_frame(&msg, "CONFIG")];
        }
        vec![]
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let actions = vec![Action::new("l", None, "local n = 1")];
    device.send_event_config(0, 0, 0, 0, 0, &actions).await.unwrap();
    assert_eq!(executes.load(Ordering::SeqCst), 3);

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn oversized_action_string_never_reaches_the_wire() {
    init_codec();
    let (transport, end) = loopback();
    let _device_task = spawn_device(end, |msg| {
        if msg.class == "CONFIG" {
            panic!("oversized config reached the device");
        }
        vec![]
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let actions = vec![Action::new("l", None, &"x = 1 ".repeat(100))];
    let result = device.send_event_config(0, 0, 0, 0, 0, &actions).await;
    assert!(matches!(result, Err(DeviceError::ConfigTooLong { .. })));

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_module_config_aborts_when_the_protocol_is_unstable() {
    init_codec();
    let (transport, end) = loopback();
    // the device never answers CONFIG fetches
    let _device_task = spawn_device(end, |_| vec![]);

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let module = test_module();
    let pages = PageFilter::new(Some([0u8].into_iter().collect()), None).unwrap();
    let result = device
        .fetch_module_config(&module, &pages, |_, _| {})
        .await;
    assert!(matches!(
        result,
        Err(DeviceError::ProtocolUnstable { failed: 6, total: 6 })
    ));

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_module_config_reports_monotonic_progress() {
    init_codec();
    let (transport, end) = loopback();
    let _device_task = spawn_device(end, move |msg| {
        if msg.class == "CONFIG" && msg.instruction == Instruction::Fetch {
            return vec![config_report(&msg, "")];
        }
        vec![]
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let module = test_module();
    let pages = PageFilter::new(Some([0u8].into_iter().collect()), None).unwrap();
    let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = progress.clone();
    let config = device
        .fetch_module_config(&module, &pages, move |done, total| {
            sink.lock().unwrap().push((done, total));
        })
        .await
        .unwrap();

    // 2 button elements x 3 supported events
    let seen = progress.lock().unwrap();
    assert_eq!(seen.len(), 6);
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(seen.iter().all(|&(_, total)| total == 6));
    assert_eq!(config.pages.len(), 1);
    assert_eq!(config.pages[0].events.len(), 6);

    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn change_page_confirms_via_pageactive_report() {
    init_codec();
    let (transport, end) = loopback();
    let _device_task = spawn_device(end, |msg| {
        if msg.class == "PAGEACTIVE" && msg.instruction == Instruction::Execute {
            let page = msg.param_int("PAGENUMBER").unwrap();
            return vec![common::reply_frame(
                0,
                0,
                "PAGEACTIVE",
                Instruction::Report,
                &[(
                    "PAGENUMBER".to_string(),
                    gridctl::protocol::Value::Str(page.to_string()),
                )],
            )];
        }
        vec![]
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    assert!(device.change_page(2, None).await.unwrap());
    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn change_page_returns_false_when_nothing_confirms() {
    init_codec();
    let (transport, end) = loopback();
    let _device_task = spawn_device(end, |_| vec![]);

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    let module = test_module();
    assert!(!device.change_page(1, Some(&module)).await.unwrap());
    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn store_and_erase_await_their_acknowledgements() {
    init_codec();
    let (transport, end) = loopback();
    let _device_task = spawn_device(end, |msg| match msg.class.as_str() {
        "PAGESTORE" if msg.instruction == Instruction::Execute => {
            vec![ack_frame(&msg, "PAGESTORE")]
        }
        "NVMERASE" if msg.instruction == Instruction::Execute => {
            vec![ack_frame(&msg, "NVMERASE")]
        }
        _ => vec![],
    });

    let link = Link::open(Box::new(transport));
    let device = Device::new(link);

    device.store_to_flash().await.unwrap();
    device.erase_nvm().await.unwrap();
    device.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_cancels_pending_waiters() {
    init_codec();
    let (transport, _end) = loopback();

    let link = Link::open(Box::new(transport));
    let device = Arc::new(Device::new(link.clone()));

    let pending = {
        let device = device.clone();
        tokio::spawn(async move { device.erase_nvm().await })
    };
    tokio::task::yield_now().await;

    device.close().await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(DeviceError::Cancelled)
    ));

    // link-level waits observe the closure as well
    let result = link
        .await_message(|m| m.class == "NEVER", 1_000)
        .await;
    assert!(matches!(result, Err(SerialError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn link_await_message_times_out() {
    init_codec();
    let (transport, end) = loopback();
    let link = Link::open(Box::new(transport));

    end.to_host
        .send(heartbeat_frame("0", "0", "1", ("1", "0", "0")))
        .unwrap();
    let heartbeat = link
        .await_message(|m| m.class == "HEARTBEAT", 1_000)
        .await
        .unwrap();
    assert_eq!(heartbeat.brc_int("SX"), Some(0));

    let result = link.await_message(|m| m.class == "NEVER", 50).await;
    assert!(matches!(result, Err(SerialError::Timeout)));

    link.close().await;
}
