use crate::options::{Fragments, ResolveError};

/// The token the fuzzing binaries replace with the current test input when
/// they invoke the harness.
pub const INPUT_PLACEHOLDER: &str = "@@";

/// Which command line layout the launched binaries expect.
///
/// The two layouts differ only in the broker-spawn slot, the
/// execution-timeout slot, and the argument separator in front of the input
/// placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandDialect {
    /// No broker-spawn or execution-timeout slots; the placeholder follows
    /// the harness path directly.
    Basic,
    /// All slots; a `-- ` separator splits harness arguments from the
    /// placeholder.
    #[default]
    Extended,
}

/// Fragment slots in the exact order the fuzzer binaries parse them. The
/// harness path and input placeholder always come last and are handled
/// separately.
const FRAGMENT_ORDER: &[&str] = &[
    "timeout",
    "bin_path",
    "spawn_client",
    "client_port",
    "spawn_broker",
    "broker_port",
    "queue_path",
    "input_path",
    "dict_path",
    "execution_timeout",
    "seed",
    "cores",
    "stdout",
    "solutions_path",
];

const EXTENDED_ONLY: &[&str] = &["spawn_broker", "execution_timeout"];

/// Concatenates resolved fragments into the final command string.
///
/// No separators are inserted here; every fragment template already carries
/// its own trailing whitespace, and absent optional fragments contribute
/// nothing at all. Only the binary and harness paths are mandatory.
pub fn assemble(fragments: &Fragments, dialect: CommandDialect) -> Result<String, ResolveError> {
    if !fragments.contains_key("bin_path") {
        return Err(ResolveError::MissingOption("bin_path"));
    }
    let harness = fragments
        .get("harness_path")
        .ok_or(ResolveError::MissingOption("harness_path"))?;

    let mut command = String::new();
    for slot in FRAGMENT_ORDER {
        if dialect == CommandDialect::Basic && EXTENDED_ONLY.contains(slot) {
            continue;
        }
        if let Some(fragment) = fragments.get(*slot) {
            command.push_str(fragment);
        }
    }

    command.push_str(harness);
    if dialect == CommandDialect::Extended {
        command.push_str("-- ");
    }
    command.push_str(INPUT_PLACEHOLDER);
    Ok(command)
}
