use anyhow::{anyhow, Result};
use hotswap_core::model::{opcodes, HandlerKind, MethodBody, Operand};

use crate::canonicalize_or_current;
use crate::commands::{find_member, load_image, parse_identity};

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Int(v) => v.to_string(),
        Operand::Float(v) => v.to_string(),
        Operand::Str(s) => format!("{s:?}"),
        Operand::Target(t) => format!("IL_{t:04}"),
        Operand::Switch(targets) => {
            let labels: Vec<String> = targets.iter().map(|t| format!("IL_{t:04}")).collect();
            format!("({})", labels.join(", "))
        }
        Operand::Method(m) => m.to_string(),
        Operand::Field(f) => format!("{}::{}", f.declaring_type, f.name),
        Operand::Property(p) => format!("{}::{}", p.declaring_type, p.name),
        Operand::Type(t) => t.to_string(),
        Operand::Local(i) => format!("V_{i}"),
        Operand::Arg(i) => format!("A_{i}"),
    }
}

/// Render a descriptive body as text, one instruction per line, followed by its regions.
pub fn render_body(body: &MethodBody) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, local) in body.locals.iter().enumerate() {
        let pinned = if local.pinned { " pinned" } else { "" };
        lines.push(format!(".local V_{i} {}{pinned}", local.ty));
    }
    for (position, instr) in body.instructions.iter().enumerate() {
        let operand = format_operand(&instr.operand);
        let mnemonic = opcodes::describe(instr.opcode);
        if operand.is_empty() {
            lines.push(format!("IL_{position:04}: {mnemonic}"));
        } else {
            lines.push(format!("IL_{position:04}: {mnemonic} {operand}"));
        }
    }
    for region in &body.regions {
        let handler = match (region.kind, &region.catch_type, region.filter_start) {
            (HandlerKind::Catch, Some(ty), _) => format!("catch {ty}"),
            (HandlerKind::Filter, _, Some(filter)) => format!("filter IL_{filter:04}"),
            (kind, _, _) => format!("{kind:?}").to_lowercase(),
        };
        lines.push(format!(
            ".try IL_{:04} to IL_{:04} {handler} IL_{:04} to IL_{:04}",
            region.try_start, region.try_end, region.handler_start, region.handler_end
        ));
    }
    lines
}

pub fn disasm_command(module: &str, member: &str) -> Result<()> {
    let path = canonicalize_or_current(module)?;
    let image = load_image(&path)?;
    let identity = parse_identity(member)?;
    let (_, method) = find_member(&image, &identity)?;
    let body = method.body.as_ref().ok_or_else(|| anyhow!("{identity} has no body"))?;

    println!("{} {identity}", method.return_type);
    for line in render_body(body) {
        println!("  {line}");
    }
    Ok(())
}
