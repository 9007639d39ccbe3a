use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};

fn emit_release_var() -> Result<(), io::Error> {
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_default();

    let cmd = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .stderr(Stdio::null())
        .output();

    match cmd {
        Ok(output) if output.status.success() => {
            let revision = String::from_utf8_lossy(&output.stdout);
            println!(
                "cargo:rustc-env=TABLESINK_RELEASE=tablesink@{version}+{}",
                revision.trim()
            );
        }
        _ => println!("cargo:rustc-env=TABLESINK_RELEASE=tablesink@{version}"),
    }

    Ok(())
}

fn list_crates() -> Vec<String> {
    let mut crates = Vec::new();

    let Ok(entries) = fs::read_dir("../") else {
        return crates;
    };

    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }

        if let Some(s) = entry.file_name().to_str() {
            if s.starts_with("tablesink") {
                crates.push(s.replace('-', "_"));
            }
        }
    }

    crates.sort();
    crates
}

fn emit_crate_list() -> Result<(), io::Error> {
    let crates = list_crates();

    let out_dir = env::var("OUT_DIR").map_err(io::Error::other)?;
    let dest_path = Path::new(&out_dir).join("constants.gen.rs");
    let mut f = File::create(dest_path)?;

    write!(f, "const CRATE_NAMES: &[&str] = &[")?;
    for name in &crates {
        write!(f, "\"{name}\",")?;
    }
    writeln!(f, "];")?;

    Ok(())
}

fn main() {
    emit_release_var().ok();
    emit_crate_list().expect("failed to generate the crate list");
    println!("cargo:rerun-if-changed=build.rs");
}
