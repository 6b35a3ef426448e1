use serde::Deserialize;
use std::path::PathBuf;
use toml::Value;
use toml::value::Table;

/// A single externally-defined harness process, started by a literal command
/// instead of resolved options.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub start_str: String,
}

/// The raw campaign configuration: a generic key/value tree split into its
/// reserved top-level sections.
///
/// `global` holds options merged into every process at the lowest precedence,
/// `proc` maps each process name to its own option table, and `client`
/// optionally describes one literal-command harness process. Option keys are
/// interpreted later, during session resolution; here only the section shape
/// and the `cores` values are checked, so that a bad core count is rejected
/// once at load time instead of being re-parsed per process.
#[derive(Debug, Clone, Default)]
pub struct CampaignConfig {
    pub global: Table,
    pub proc: Table,
    pub client: Option<ClientConfig>,
}

impl CampaignConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Bad campaign config {:?}: {}", path, e))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, anyhow::Error> {
        let tree: Table =
            toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        Self::from_tree(tree)
    }

    /// Splits an already-parsed tree into the reserved sections.
    pub fn from_tree(mut tree: Table) -> Result<Self, anyhow::Error> {
        let global = match tree.remove("global") {
            Some(Value::Table(table)) => table,
            Some(_) => anyhow::bail!("[global] must be a table of options"),
            None => anyhow::bail!("config has no [global] section"),
        };

        let proc = match tree.remove("proc") {
            Some(Value::Table(table)) => table,
            Some(_) => anyhow::bail!("[proc] must be a table of process tables"),
            None => anyhow::bail!("config has no [proc] section"),
        };

        let client = match tree.remove("client") {
            Some(value) => Some(
                value
                    .try_into::<ClientConfig>()
                    .map_err(|e| anyhow::anyhow!("Bad [client] section: {}", e))?,
            ),
            None => None,
        };

        if let Some(stray) = tree.keys().next() {
            anyhow::bail!("unrecognized top-level section \"{}\"", stray);
        }

        validate_cores("global", &global)?;
        for (name, value) in &proc {
            let table = value
                .as_table()
                .ok_or_else(|| anyhow::anyhow!("[proc.{}] must be a table of options", name))?;
            validate_cores(name, table)?;
        }

        Ok(Self {
            global,
            proc,
            client,
        })
    }
}

fn validate_cores(section: &str, table: &Table) -> Result<(), anyhow::Error> {
    match table.get("cores") {
        None => Ok(()),
        Some(Value::Integer(count)) if *count >= 1 => Ok(()),
        Some(other) => anyhow::bail!(
            "\"cores\" in \"{}\" must be a positive integer, got {}",
            section,
            other
        ),
    }
}
