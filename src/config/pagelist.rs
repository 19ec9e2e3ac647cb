use std::collections::BTreeSet;

use super::{ConfigError, Result};

/// Pages available on every module.
pub const ALL_PAGES: [u8; 4] = [0, 1, 2, 3];

/// Parse a page-list argument: comma-separated items, each a non-negative
/// integer or an inclusive `lo-hi` range with `lo <= hi`.
pub fn parse_page_list(input: &str) -> Result<BTreeSet<u8>> {
    let mut pages = BTreeSet::new();

    for item in input.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(ConfigError::InvalidPageList(format!(
                "empty item in {:?}",
                input
            )));
        }
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_page(lo, input)?;
                let hi = parse_page(hi, input)?;
                if lo > hi {
                    return Err(ConfigError::InvalidPageList(format!(
                        "descending range {}-{}",
                        lo, hi
                    )));
                }
                pages.extend(lo..=hi);
            }
            None => {
                pages.insert(parse_page(item, input)?);
            }
        }
    }

    Ok(pages)
}

fn parse_page(s: &str, input: &str) -> Result<u8> {
    s.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPageList(format!("bad page {:?} in {:?}", s, input)))
}

/// Include/exclude page selection; at most one side may be set.
#[derive(Debug, Clone, Default)]
pub struct PageFilter {
    include: Option<BTreeSet<u8>>,
    exclude: Option<BTreeSet<u8>>,
}

impl PageFilter {
    pub fn new(include: Option<BTreeSet<u8>>, exclude: Option<BTreeSet<u8>>) -> Result<Self> {
        if include.is_some() && exclude.is_some() {
            return Err(ConfigError::InvalidPageList(
                "pages and skip-pages are mutually exclusive".to_string(),
            ));
        }
        for set in include.iter().chain(exclude.iter()) {
            if let Some(&page) = set.iter().find(|&&p| !ALL_PAGES.contains(&p)) {
                return Err(ConfigError::InvalidPageList(format!(
                    "page {} out of range 0..3",
                    page
                )));
            }
        }
        Ok(Self { include, exclude })
    }

    /// The selected pages in ascending order: the include set, or all
    /// pages minus the exclude set.
    pub fn pages(&self) -> Vec<u8> {
        match (&self.include, &self.exclude) {
            (Some(include), _) => include.iter().copied().collect(),
            (None, Some(exclude)) => ALL_PAGES
                .iter()
                .copied()
                .filter(|p| !exclude.contains(p))
                .collect(),
            (None, None) => ALL_PAGES.to_vec(),
        }
    }
}
