//! Subscription registry.
//!
//! Loads the declarative instrument list from an INI file, one section
//! per subscription:
//!
//! ```ini
//! [okx_btc]
//! exchange = Okx
//! instmt_name = BTC
//! instmt_code = spot_btc_usdt
//! ```
//!
//! `exchange`, `instmt_name` and `instmt_code` are required; every other
//! key is preserved verbatim and attached to the instrument as an opaque
//! string.

use std::collections::{BTreeMap, HashMap};

use config::{Config, File, FileFormat};

use crate::error::{FeedError, Result};

#[derive(Debug, Clone)]
pub struct Subscription {
    pub exchange: String,
    pub instmt_name: String,
    pub instmt_code: String,
    pub extras: HashMap<String, String>,
}

/// Load every subscription section from `path`.
///
/// Sections are returned in section-name order so worker startup is
/// deterministic. An unreadable file or a section missing a required key
/// is a configuration error.
pub fn load_subscriptions(path: &str) -> Result<Vec<Subscription>> {
    let sections: BTreeMap<String, HashMap<String, String>> = Config::builder()
        .add_source(File::new(path, FileFormat::Ini))
        .build()?
        .try_deserialize()?;

    let mut subscriptions = Vec::with_capacity(sections.len());
    for (section, mut keys) in sections {
        let exchange = take_required(&mut keys, &section, "exchange")?;
        let instmt_name = take_required(&mut keys, &section, "instmt_name")?;
        let instmt_code = take_required(&mut keys, &section, "instmt_code")?;
        subscriptions.push(Subscription {
            exchange,
            instmt_name,
            instmt_code,
            extras: keys,
        });
    }
    Ok(subscriptions)
}

fn take_required(
    keys: &mut HashMap<String, String>,
    section: &str,
    key: &str,
) -> Result<String> {
    keys.remove(key)
        .ok_or_else(|| FeedError::Config(format!("subscription [{section}] is missing '{key}'")))
}
