use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::command::{self, CommandDialect};
use crate::config::CampaignConfig;
use crate::cores::CoreAllocator;
use crate::options::{self, Fragments, ResolveError};
use crate::process::{ProcessError, ProcessHandle, ProcessStatus};

/// Where a campaign lives when the config does not say otherwise.
const DEFAULT_ROOT: &str = "./fuzz_results";

/// The name under which the literal-command harness process is registered.
const CLIENT_NAME: &str = "client";

/// Defines errors that can arise while building a session.
///
/// Building is all-or-nothing: the first error aborts the whole build and no
/// process handles are registered for partial use.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Option resolution failed for the named process (or for `global`).
    #[error("process \"{name}\": {source}")]
    Resolve {
        name: String,
        source: ResolveError,
    },

    /// The session root directory could not be set up.
    #[error("failed to prepare session root {path:?}: {source}")]
    Root {
        path: PathBuf,
        source: io::Error,
    },
}

/// One fuzzing campaign: the named process handles, in configuration order,
/// plus the core allocator that pinned them and the root directory their
/// working directories nest under.
#[derive(Debug)]
pub struct Session {
    processes: Vec<(String, ProcessHandle)>,
    root: PathBuf,
    cores: CoreAllocator,
}

impl Session {
    /// Resolves the whole configuration into launch-ready process handles.
    ///
    /// `global` is resolved once; each `proc` entry is then seeded with its
    /// name-derived defaults, resolved, and laid over the global fragments
    /// (specific keys win). A `client` section contributes one extra handle
    /// whose command is the configured literal start string.
    pub fn build(
        config: &CampaignConfig,
        mut cores: CoreAllocator,
        dialect: CommandDialect,
    ) -> Result<Self, BuildError> {
        let mut global = config.global.clone();

        // In global scope `fuzz_path` relocates the session root instead of
        // producing a fragment.
        let root = match global.remove("fuzz_path") {
            Some(value) => {
                let raw = value.as_str().ok_or_else(|| BuildError::Resolve {
                    name: "global".to_owned(),
                    source: ResolveError::InvalidValue {
                        key: "fuzz_path".to_owned(),
                        expected: "a path string",
                    },
                })?;
                absolute_root(raw)?
            }
            None => absolute_root(DEFAULT_ROOT)?,
        };
        fs::create_dir_all(&root).map_err(|source| BuildError::Root {
            path: root.clone(),
            source,
        })?;

        let global_fragments = options::resolve("global", &global, &root, &mut cores)
            .map_err(|source| BuildError::Resolve {
                name: "global".to_owned(),
                source,
            })?;

        let mut processes = Vec::with_capacity(config.proc.len() + 1);
        for (name, value) in &config.proc {
            let table = value.as_table().ok_or_else(|| BuildError::Resolve {
                name: name.clone(),
                source: ResolveError::InvalidValue {
                    key: name.clone(),
                    expected: "an option table",
                },
            })?;

            let own = options::resolve(name, table, &root, &mut cores).map_err(|source| {
                BuildError::Resolve {
                    name: name.clone(),
                    source,
                }
            })?;
            let mut fragments = global_fragments.clone();
            fragments.extend(own);
            debug!(process = %name, ?fragments, "merged configuration");

            let work_dir = fragment_path(&fragments, "fuzz_path", &root);
            let log_path = fragment_path(&fragments, "log_path", &root);
            let command = command::assemble(&fragments, dialect).map_err(|source| {
                BuildError::Resolve {
                    name: name.clone(),
                    source,
                }
            })?;

            processes.push((name.clone(), ProcessHandle::new(command, work_dir, log_path)));
        }

        if let Some(client) = &config.client {
            debug!(start_str = %client.start_str, "registering literal client process");
            // The literal client owns its name; a proc entry that reused it
            // is replaced, keeping one handle per name.
            processes.retain(|(name, _)| name != CLIENT_NAME);
            processes.push((
                CLIENT_NAME.to_owned(),
                ProcessHandle::new(
                    client.start_str.clone(),
                    root.clone(),
                    root.join("client.log"),
                ),
            ));
        }

        info!(
            processes = processes.len(),
            cores = cores.allocated(),
            root = %root.display(),
            "session built"
        );
        Ok(Self {
            processes,
            root,
            cores,
        })
    }

    /// Starts every process in insertion order. A handle that fails to start
    /// does not stop the sweep; each outcome is reported under its name so a
    /// partially-failed campaign can still be inspected.
    pub fn start_all(&mut self) -> Vec<(String, Result<u32, ProcessError>)> {
        self.processes
            .iter_mut()
            .map(|(name, handle)| {
                info!(process = %name, "starting");
                (name.clone(), handle.start())
            })
            .collect()
    }

    /// One independent liveness snapshot per process, in insertion order.
    pub fn status_all(&mut self) -> Vec<(String, ProcessStatus)> {
        self.processes
            .iter_mut()
            .map(|(name, handle)| (name.clone(), handle.status()))
            .collect()
    }

    /// Terminates every process, continuing past individual failures so no
    /// sibling is left orphaned; the failures are returned as one report.
    pub fn terminate_all(&mut self) -> Vec<(String, ProcessError)> {
        let mut failures = Vec::new();
        for (name, handle) in &mut self.processes {
            match handle.terminate() {
                Ok(()) => info!(process = %name, "terminated"),
                Err(err) => failures.push((name.clone(), err)),
            }
        }
        failures
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cores(&self) -> &CoreAllocator {
        &self.cores
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = (&str, &ProcessHandle)> {
        self.processes
            .iter()
            .map(|(name, handle)| (name.as_str(), handle))
    }

    pub fn get(&self, name: &str) -> Option<&ProcessHandle> {
        self.processes
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, handle)| handle)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ProcessHandle> {
        self.processes
            .iter_mut()
            .find(|(known, _)| known == name)
            .map(|(_, handle)| handle)
    }
}

fn absolute_root(raw: &str) -> Result<PathBuf, BuildError> {
    std::path::absolute(raw).map_err(|source| BuildError::Root {
        path: PathBuf::from(raw),
        source,
    })
}

/// Reads a pass-through path fragment back out of the merged map. The
/// per-process defaults guarantee both keys for resolved processes; the
/// root is only a fallback for hand-built fragment maps.
fn fragment_path(fragments: &Fragments, key: &str, root: &Path) -> PathBuf {
    fragments
        .get(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cores::AllocError;
    use tempfile::tempdir;
    use toml::value::Table;

    fn build_from(toml: &str, total_cores: usize) -> Result<Session, BuildError> {
        let config = CampaignConfig::from_toml_str(toml).unwrap();
        Session::build(
            &config,
            CoreAllocator::with_total(0, total_cores),
            CommandDialect::Extended,
        )
    }

    #[test]
    fn end_to_end_single_process_resolution() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"

            [proc.a]
            cores = 1
            seed = 7
            harness_path = "{root}/target"
            "#,
            root = scratch.path().display()
        );

        let session = build_from(&toml, 8).unwrap();
        assert_eq!(session.len(), 1);

        let handle = session.get("a").unwrap();
        let command = handle.command();
        assert!(command.contains("nn_fuzz "), "got: {command:?}");
        assert!(command.contains("-c 0 "), "got: {command:?}");
        assert!(command.contains("--seed 7 "), "got: {command:?}");

        let proc_dir = scratch.path().join("a");
        assert!(command.contains(&format!("-o {} ", proc_dir.join("solutions").display())));
        assert!(command.contains(&format!(
            "-q {} ",
            proc_dir.join("corpus_discovered").display()
        )));
        assert!(command.ends_with("-- @@"));

        assert_eq!(handle.work_dir(), proc_dir);
        assert_eq!(handle.log_path(), proc_dir.join("stats.log"));
        assert!(proc_dir.join("solutions").is_dir());
    }

    #[test]
    fn per_process_options_override_global_ones() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"
            seed = 1
            harness_path = "{root}/target"

            [proc.a]
            seed = 42
            "#,
            root = scratch.path().display()
        );

        let session = build_from(&toml, 8).unwrap();
        let command = session.get("a").unwrap().command();
        assert!(command.contains("--seed 42 "), "got: {command:?}");
        assert!(!command.contains("--seed 1 "), "got: {command:?}");
    }

    #[test]
    fn sibling_processes_get_disjoint_core_ranges() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"
            harness_path = "{root}/target"

            [proc.a]
            cores = 2

            [proc.b]
            cores = 2
            "#,
            root = scratch.path().display()
        );

        let session = build_from(&toml, 8).unwrap();
        assert!(session.get("a").unwrap().command().contains("-c 0-1 "));
        assert!(session.get("b").unwrap().command().contains("-c 2-3 "));
        assert_eq!(session.cores().allocated(), 4);
    }

    #[test]
    fn build_is_atomic_on_unknown_options() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"
            harness_path = "{root}/target"

            [proc.a]
            seed = 7

            [proc.b]
            bogus_knob = true
            "#,
            root = scratch.path().display()
        );

        let err = build_from(&toml, 8).unwrap_err();
        match err {
            BuildError::Resolve {
                name,
                source: ResolveError::UnknownOption(key),
            } => {
                assert_eq!(name, "b");
                assert_eq!(key, "bogus_knob");
            }
            other => panic!("expected UnknownOption for b, got {other:?}"),
        }
    }

    #[test]
    fn build_fails_when_cores_run_out() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"
            harness_path = "{root}/target"

            [proc.a]
            cores = 2

            [proc.b]
            cores = 2
            "#,
            root = scratch.path().display()
        );

        let err = build_from(&toml, 3).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Resolve {
                source: ResolveError::Cores(AllocError::ResourceExhausted { .. }),
                ..
            }
        ));
    }

    #[test]
    fn missing_binary_role_fails_the_build() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            harness_path = "{root}/target"

            [proc.a]
            seed = 7
            "#,
            root = scratch.path().display()
        );

        let err = build_from(&toml, 8).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Resolve {
                source: ResolveError::MissingOption("bin_path"),
                ..
            }
        ));
    }

    #[test]
    fn client_handle_keeps_the_literal_start_string() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"
            harness_path = "{root}/target"

            [proc.a]
            seed = 7

            [client]
            start_str = "python3 harness.py --port 7878"
            "#,
            root = scratch.path().display()
        );

        let session = build_from(&toml, 8).unwrap();
        assert_eq!(session.len(), 2);

        let client = session.get("client").unwrap();
        assert_eq!(client.command(), "python3 harness.py --port 7878");
        assert_eq!(client.work_dir(), scratch.path());
        assert_eq!(client.log_path(), scratch.path().join("client.log"));
    }

    #[test]
    fn registration_follows_configuration_order() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"
            type = "fuzz"
            harness_path = "{root}/target"

            [proc.broker]
            [proc.worker_1]
            [proc.worker_2]

            [client]
            start_str = "run-harness"
            "#,
            root = scratch.path().display()
        );

        let session = build_from(&toml, 8).unwrap();
        let names: Vec<&str> = session.handles().map(|(name, _)| name).collect();
        assert_eq!(names, ["broker", "worker_1", "worker_2", "client"]);
    }

    #[test]
    fn lifecycle_sweeps_cover_every_process() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"

            [proc.a]
            [proc.b]

            [client]
            start_str = "sleep 30"
            "#,
            root = scratch.path().display()
        );

        // The fuzzer binaries are not present in a test environment, so
        // drive the sweeps through the literal client only.
        let mut config = CampaignConfig::from_toml_str(&toml).unwrap();
        config.proc = Table::new();
        let mut session = Session::build(
            &config,
            CoreAllocator::with_total(0, 8),
            CommandDialect::Extended,
        )
        .unwrap();

        let started = session.start_all();
        assert_eq!(started.len(), 1);
        assert!(started[0].1.is_ok());

        let statuses = session.status_all();
        assert_eq!(statuses[0].1, ProcessStatus::Running);

        assert!(session.terminate_all().is_empty());
        assert!(matches!(
            session.status_all()[0].1,
            ProcessStatus::Exited(_)
        ));

        // A second sweep is a best-effort no-op on the exited tree.
        assert!(session.terminate_all().is_empty());
    }

    #[test]
    fn terminate_all_reports_unstarted_processes() {
        let scratch = tempdir().unwrap();
        let toml = format!(
            r#"
            [global]
            fuzz_path = "{root}"

            [proc.a]

            [client]
            start_str = "sleep 30"
            "#,
            root = scratch.path().display()
        );
        let mut config = CampaignConfig::from_toml_str(&toml).unwrap();
        config.proc = Table::new();

        let mut session = Session::build(
            &config,
            CoreAllocator::with_total(0, 8),
            CommandDialect::Extended,
        )
        .unwrap();

        let failures = session.terminate_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "client");
        assert!(matches!(failures[0].1, ProcessError::NotStarted));
    }
}
