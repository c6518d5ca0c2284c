use anyhow::Result;
use hotswap_core::model::IdentityKey;
use serde::Serialize;

use crate::commands::load_image;
use crate::{canonicalize_or_current, sha256_file};

#[derive(Debug, Serialize)]
pub struct ModuleSummary {
    pub name: String,
    pub version: String,
    pub module_name: String,
    pub sha256: String,
    pub types: Vec<TypeSummary>,
}

#[derive(Debug, Serialize)]
pub struct TypeSummary {
    pub name: String,
    pub fields: Vec<String>,
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Serialize)]
pub struct MemberSummary {
    pub identity: String,
    pub return_type: String,
    pub is_static: bool,
    pub reloadable: bool,
    pub has_body: bool,
}

/// Summarize a module file: its name, types, members and which members are reloadable.
pub fn summarize_module(path: &str) -> Result<ModuleSummary> {
    let path = canonicalize_or_current(path)?;
    let image = load_image(&path)?;
    let sha256 = sha256_file(&path)?;

    let types = image
        .types
        .iter()
        .map(|ty| TypeSummary {
            name: ty.full_name.clone(),
            fields: ty
                .fields
                .iter()
                .map(|f| {
                    let prefix = if f.is_static { "static " } else { "" };
                    format!("{prefix}{} {}", f.ty, f.name)
                })
                .collect(),
            members: ty
                .methods
                .iter()
                .map(|m| MemberSummary {
                    identity: IdentityKey::for_def(&ty.full_name, m)
                        .map(|k| k.to_string())
                        .unwrap_or_else(|e| format!("<{e}>")),
                    return_type: m.return_type.to_string(),
                    is_static: m.is_static,
                    reloadable: m.is_reloadable(),
                    has_body: m.body.is_some(),
                })
                .collect(),
        })
        .collect();

    Ok(ModuleSummary {
        name: image.name.name.clone(),
        version: image.name.version.to_string(),
        module_name: image.module_name.clone(),
        sha256,
        types,
    })
}

pub fn inspect_command(module: &str, json: bool) -> Result<()> {
    let summary = summarize_module(module)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Module: {} {} ({})", summary.name, summary.version, summary.module_name);
    println!("SHA-256: {}", summary.sha256);
    if summary.types.is_empty() {
        println!("No types.");
    }
    for ty in &summary.types {
        println!("{}", ty.name);
        for field in &ty.fields {
            println!("  field {field}");
        }
        for member in &ty.members {
            let mut flags = Vec::new();
            if member.is_static {
                flags.push("static");
            }
            if member.reloadable {
                flags.push("reloadable");
            }
            if !member.has_body {
                flags.push("no body");
            }
            let flags =
                if flags.is_empty() { String::new() } else { format!(" [{}]", flags.join(", ")) };
            println!("  {} {}{flags}", member.return_type, member.identity);
        }
    }
    Ok(())
}
