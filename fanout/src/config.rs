//! Persisted configuration store.
//!
//! A sectioned key/value file ($HOME/.fanoutconfig): a `default` section
//! plus user-defined sections, addressed with dotted keys (`local.tmpdir`
//! is key `tmpdir` in section `local`; bare keys live in `default`).
//! Every `default` key is also exported to the environment as
//! `<PREFIX>_<KEY>` before flag parsing so flags can be defaulted via env.
//! The store is set up once, before a run starts, and read-only after.

use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::path::PathBuf;
use toml::Value;

pub const DEFAULT_SECTION: &str = "default";

pub struct Setting {
    /// Directory holding the config file; the home directory when empty.
    pub path: Option<PathBuf>,
    pub file_name: String,
    pub env_prefix: String,
    pub defaults: Vec<(String, String)>,
}

static STORE: OnceCell<RwLock<Store>> = OnceCell::new();

/// Loads (or creates) the config file, fills missing defaults, persists
/// them, and exports the `default` section to the environment.
pub fn setup(setting: Setting) -> Result<(), Report> {
    let dir = match setting.path {
        Some(path) => path,
        None => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
    };
    let mut store = Store::load(dir.join(&setting.file_name))?;
    for (key, value) in &setting.defaults {
        store.set_default(key, value);
    }
    store.save()?;
    store.bind_env(&setting.env_prefix);
    let _ = STORE.set(RwLock::new(store));
    Ok(())
}

/// Returns the string value for a dotted key; empty when missing or when
/// the store was never set up.
pub fn get_string(key: &str) -> String {
    STORE
        .get()
        .map(|lock| lock.read().get_string(key))
        .unwrap_or_default()
}

pub fn get_int(key: &str) -> i64 {
    get_string(key).parse().unwrap_or(0)
}

pub fn get_bool(key: &str) -> bool {
    get_string(key).parse().unwrap_or(false)
}

/// Writes one setting and persists the file.
pub fn set(key: &str, value: &str) -> Result<(), Report> {
    let lock = STORE
        .get()
        .ok_or_else(|| color_eyre::eyre::eyre!("config store not initialized"))?;
    let mut store = lock.write();
    store.set(key, value);
    store.save()
}

struct Store {
    path: PathBuf,
    table: toml::Table,
}

fn section_and_key(raw: &str) -> (String, String) {
    let fields: Vec<&str> = raw.split('.').collect();
    if fields.len() > 1 {
        (fields[0].to_string(), fields[fields.len() - 1].to_string())
    } else {
        (DEFAULT_SECTION.to_string(), raw.to_string())
    }
}

impl Store {
    fn load(path: PathBuf) -> Result<Self, Report> {
        let table = if path.exists() {
            let content = std::fs::read_to_string(&path).wrap_err("read config")?;
            content.parse::<toml::Table>().wrap_err("parse config")?
        } else {
            toml::Table::new()
        };
        Ok(Self { path, table })
    }

    fn save(&self) -> Result<(), Report> {
        let rendered = toml::to_string_pretty(&self.table).wrap_err("render config")?;
        std::fs::write(&self.path, rendered).wrap_err("write config")
    }

    fn get_string(&self, raw: &str) -> String {
        let (section, key) = section_and_key(raw);
        match self
            .table
            .get(&section)
            .and_then(Value::as_table)
            .and_then(|table| table.get(&key))
        {
            Some(Value::String(value)) => value.trim().to_string(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn set(&mut self, raw: &str, value: &str) {
        let (section, key) = section_and_key(raw);
        let entry = self
            .table
            .entry(section)
            .or_insert_with(|| Value::Table(toml::Table::new()));
        if let Some(table) = entry.as_table_mut() {
            table.insert(key, Value::String(value.to_string()));
        }
    }

    fn set_default(&mut self, raw: &str, value: &str) {
        if self.get_string(raw).is_empty() {
            self.set(raw, value);
        }
    }

    /// Exports `default` keys as `<PREFIX>_<KEY>`; existing env wins.
    fn bind_env(&self, prefix: &str) {
        let Some(section) = self.table.get(DEFAULT_SECTION).and_then(Value::as_table) else {
            return;
        };
        for (key, value) in section {
            let env_key = if prefix.is_empty() {
                key.to_uppercase()
            } else {
                format!("{}_{}", prefix, key.to_uppercase())
            };
            if std::env::var_os(&env_key).is_none() {
                if let Some(value) = value.as_str() {
                    std::env::set_var(&env_key, value);
                }
            }
        }
    }
}
