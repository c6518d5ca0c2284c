use anyhow::{anyhow, Context, Result};
use hotswap_core::model::read_module_bytes;
use hotswap_core::runtime::{Emitter, Runtime};
use hotswap_core::translate::{Translator, VersionPolicy};

use crate::canonicalize_or_current;
use crate::commands::{find_member, load_image, parse_identity};

/// Translate one member of `module` against a runtime holding the `live` modules.
///
/// The target module itself is loaded inert, the way a reloaded revision would be, so
/// references into it that have no live counterpart fail resolution here too.
pub fn translate_member(
    module: &str,
    member: &str,
    live: &[String],
    policy: VersionPolicy,
) -> Result<Vec<String>> {
    let runtime = Runtime::new().context("Failed to start the host runtime")?;
    for live_module in live {
        let path = canonicalize_or_current(live_module)?;
        let bytes = read_module_bytes(&path)?;
        runtime
            .load_live_bytes(&bytes)
            .with_context(|| format!("Failed to load live module {}", path.display()))?;
    }

    let path = canonicalize_or_current(module)?;
    let image = load_image(&path)?;
    runtime
        .load_inert(&image)
        .with_context(|| format!("Failed to load {} for inspection", path.display()))?;

    let identity = parse_identity(member)?;
    let (_, method) = find_member(&image, &identity)?;
    let body = method.body.as_ref().ok_or_else(|| anyhow!("{identity} has no body"))?;

    let mut emitter = Emitter::new();
    let instructions = Translator::new(&runtime, policy)
        .translate(body, &mut emitter)
        .with_context(|| format!("Failed to translate {identity}"))?;

    let mut lines: Vec<String> = emitter
        .locals()
        .iter()
        .map(|local| format!(".local {} {}", local.index, local.ty.display_name()))
        .collect();
    lines.extend(instructions.iter().enumerate().map(|(i, instr)| format!("{i:04}: {instr}")));
    Ok(lines)
}

pub fn translate_command(
    module: &str,
    member: &str,
    live: &[String],
    policy: VersionPolicy,
) -> Result<()> {
    for line in translate_member(module, member, live, policy)? {
        println!("{line}");
    }
    Ok(())
}
