use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml::Value;
use toml::value::Table;
use tracing::debug;

use crate::cores::{AllocError, CoreAllocator};

/// Defines errors that can arise while turning raw option values into
/// command fragments.
///
/// Any of these aborts the whole session build: a campaign must never start
/// partially configured.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The key is not present in any of the three option registries.
    #[error("there is no \"{0}\" option")]
    UnknownOption(String),

    /// The `type` option named a role with no known binary.
    #[error("there is no \"{0}\" process type")]
    UnknownRole(String),

    /// A registered key was given a value of the wrong shape.
    #[error("option \"{key}\" expects {expected}")]
    InvalidValue {
        key: String,
        expected: &'static str,
    },

    /// A fragment required by the command layout was never produced.
    #[error("required option \"{0}\" was never resolved")]
    MissingOption(&'static str),

    /// Core reservation failed; carries the allocator's own diagnosis.
    #[error(transparent)]
    Cores(#[from] AllocError),

    /// A path option could not be normalized or its directory created.
    #[error("failed to prepare path {path:?}: {source}")]
    PathSetup {
        path: PathBuf,
        source: io::Error,
    },
}

/// The map of resolved command fragments for one process, keyed by option
/// name. Fragment presence, not truthiness, is what the assembly step reads,
/// so flags that resolve to nothing are absent rather than empty.
pub type Fragments = BTreeMap<String, String>;

/// How a recognized option key is interpreted.
#[derive(Debug, Clone, Copy)]
enum OptionKind {
    /// A key-specific rule that may emit a fragment or nothing at all.
    Flag(FlagRule),
    /// The value is substituted verbatim into the template.
    Substitution { template: &'static str },
    /// The value is a filesystem path, normalized to absolute form before
    /// substitution; some of these also create the directory they name.
    Path {
        template: &'static str,
        creates_dir: bool,
    },
}

#[derive(Debug, Clone, Copy)]
enum FlagRule {
    /// `true` emits `-S `, `false` emits nothing.
    SpawnClient,
    /// `true` emits nothing, `false` emits `-B `: the fuzzer spawns its
    /// broker unless told not to.
    SpawnBroker,
    /// Selects the binary for the process and stores it as `bin_path`.
    Role,
    /// Reserves cores through the allocator and emits the `-c` range.
    Cores,
}

/// Every key a process table may contain. A key that is absent from this
/// table is a configuration error, not a passthrough.
const REGISTRY: &[(&str, OptionKind)] = &[
    ("spawn_client", OptionKind::Flag(FlagRule::SpawnClient)),
    ("spawn_broker", OptionKind::Flag(FlagRule::SpawnBroker)),
    ("type", OptionKind::Flag(FlagRule::Role)),
    ("cores", OptionKind::Flag(FlagRule::Cores)),
    ("broker_port", OptionKind::Substitution { template: "--broker-port {} " }),
    ("client_port", OptionKind::Substitution { template: "--client-port {} " }),
    ("slave_port", OptionKind::Substitution { template: "--port {} " }),
    ("seed", OptionKind::Substitution { template: "--seed {} " }),
    ("timeout", OptionKind::Substitution { template: "timeout -s SIGINT {} " }),
    ("execution_timeout", OptionKind::Substitution { template: "-t {} " }),
    ("fuzz_path", OptionKind::Path { template: "{}", creates_dir: true }),
    ("harness_path", OptionKind::Path { template: "{} ", creates_dir: false }),
    ("stdout", OptionKind::Path { template: "--stdout {} ", creates_dir: false }),
    ("input_path", OptionKind::Path { template: "-i {} ", creates_dir: false }),
    ("dict_path", OptionKind::Path { template: "-x {} ", creates_dir: false }),
    ("solutions_path", OptionKind::Path { template: "-o {} ", creates_dir: true }),
    ("log_path", OptionKind::Path { template: "{}", creates_dir: false }),
    ("queue_path", OptionKind::Path { template: "-q {} ", creates_dir: true }),
];

/// The two binary roles a process can take: the fuzzing engine proper and
/// the headless slave.
const ROLES: &[(&str, &str)] = &[("fuzz", "./nn_fuzz"), ("slave", "./nn_slave")];

fn registry_lookup(key: &str) -> Option<OptionKind> {
    REGISTRY
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, kind)| *kind)
}

/// Resolves one raw option table into its command fragments.
///
/// Process names other than `global` and `client` are first seeded with
/// name-derived defaults (a working subdirectory under `root` plus the
/// stdout/log/solutions/queue paths nested in it, and one core), which the
/// raw table then overrides key by key.
pub fn resolve(
    name: &str,
    raw: &Table,
    root: &Path,
    cores: &mut CoreAllocator,
) -> Result<Fragments, ResolveError> {
    let merged = if name != "global" && name != "client" {
        let mut seeded = name_defaults(root, name);
        for (key, value) in raw {
            seeded.insert(key.clone(), value.clone());
        }
        seeded
    } else {
        raw.clone()
    };

    let mut fragments = Fragments::new();
    for (key, value) in &merged {
        match registry_lookup(key) {
            None => return Err(ResolveError::UnknownOption(key.clone())),
            Some(OptionKind::Flag(rule)) => {
                resolve_flag(rule, key, value, cores, &mut fragments)?
            }
            Some(OptionKind::Substitution { template }) => {
                let text = scalar_text(key, value)?;
                fragments.insert(key.clone(), fill(template, &text));
            }
            Some(OptionKind::Path { template, creates_dir }) => {
                let normalized = normalize_path(key, value)?;
                if creates_dir {
                    fs::create_dir_all(&normalized).map_err(|source| {
                        ResolveError::PathSetup {
                            path: normalized.clone(),
                            source,
                        }
                    })?;
                }
                let text = normalized.display().to_string();
                fragments.insert(key.clone(), fill(template, &text));
            }
        }
    }

    debug!(process = name, count = fragments.len(), "options resolved");
    Ok(fragments)
}

/// The default per-process layout, nested under the session root.
fn name_defaults(root: &Path, name: &str) -> Table {
    let dir = root.join(name);
    let path_value = |path: PathBuf| Value::String(path.display().to_string());

    let mut defaults = Table::new();
    defaults.insert("fuzz_path".into(), path_value(dir.clone()));
    defaults.insert("stdout".into(), path_value(dir.join("fuzz.out")));
    defaults.insert("log_path".into(), path_value(dir.join("stats.log")));
    defaults.insert("solutions_path".into(), path_value(dir.join("solutions")));
    defaults.insert("queue_path".into(), path_value(dir.join("corpus_discovered")));
    defaults.insert("cores".into(), Value::Integer(1));
    defaults
}

fn resolve_flag(
    rule: FlagRule,
    key: &str,
    value: &Value,
    cores: &mut CoreAllocator,
    fragments: &mut Fragments,
) -> Result<(), ResolveError> {
    match rule {
        FlagRule::SpawnClient => {
            if bool_value(key, value)? {
                fragments.insert(key.to_owned(), "-S ".to_owned());
            }
        }
        FlagRule::SpawnBroker => {
            if !bool_value(key, value)? {
                fragments.insert(key.to_owned(), "-B ".to_owned());
            }
        }
        FlagRule::Role => {
            let role = value.as_str().ok_or_else(|| ResolveError::InvalidValue {
                key: key.to_owned(),
                expected: "a process type string",
            })?;
            let binary = ROLES
                .iter()
                .find(|(known, _)| *known == role)
                .map(|(_, binary)| *binary)
                .ok_or_else(|| ResolveError::UnknownRole(role.to_owned()))?;
            let absolute = std::path::absolute(binary).map_err(|source| {
                ResolveError::PathSetup {
                    path: PathBuf::from(binary),
                    source,
                }
            })?;
            fragments.insert("bin_path".to_owned(), format!("{} ", absolute.display()));
        }
        FlagRule::Cores => {
            let count = value
                .as_integer()
                .filter(|count| *count >= 1)
                .ok_or_else(|| ResolveError::InvalidValue {
                    key: key.to_owned(),
                    expected: "a positive integer",
                })?;
            let range = cores.allocate(count as usize)?;
            fragments.insert(key.to_owned(), format!("-c {range} "));
        }
    }
    Ok(())
}

fn bool_value(key: &str, value: &Value) -> Result<bool, ResolveError> {
    value.as_bool().ok_or_else(|| ResolveError::InvalidValue {
        key: key.to_owned(),
        expected: "a boolean",
    })
}

fn scalar_text(key: &str, value: &Value) -> Result<String, ResolveError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Integer(number) => Ok(number.to_string()),
        Value::Float(number) => Ok(number.to_string()),
        Value::Boolean(flag) => Ok(flag.to_string()),
        _ => Err(ResolveError::InvalidValue {
            key: key.to_owned(),
            expected: "a scalar value",
        }),
    }
}

fn normalize_path(key: &str, value: &Value) -> Result<PathBuf, ResolveError> {
    let raw = value.as_str().ok_or_else(|| ResolveError::InvalidValue {
        key: key.to_owned(),
        expected: "a path string",
    })?;
    std::path::absolute(raw).map_err(|source| ResolveError::PathSetup {
        path: PathBuf::from(raw),
        source,
    })
}

fn fill(template: &str, value: &str) -> String {
    template.replacen("{}", value, 1)
}
