//! Symbol store updates.
//!
//! Once the source server has indexed a build's debug information, the
//! build's executable and symbol file are added to the symbol store with one
//! `symstore` invocation per tick. [`plan`] lays out those invocations as a
//! queue the state machine drains.

use std::collections::VecDeque;
use std::path::Path;

use crate::dispatcher::files;

pub const EXE_INDEX: &str = "exe_index.txt";
pub const PDB_INDEX: &str = "pdb_index.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymStoreStep {
    /// Remove index files left behind by an earlier update.
    DeleteIndexes,
    /// Announce the executable about to be stored.
    Status(String),
    /// Run the symbol store tool with this command line.
    Run(String),
}

/// Where and under which version a build's symbols are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolUpload {
    pub store: String,
    pub platform: String,
    pub changelist: i64,
    pub version: i64,
}

/// Executable and symbol file of a game build, relative to the workspace.
pub fn binaries(game: &str, platform: &str, config: &str) -> Option<(String, String)> {
    let game = format!("{game}Game");
    match platform.to_lowercase().as_str() {
        "pc" => {
            let stem = match config.to_lowercase().as_str() {
                "release" => game.clone(),
                "releaseltcg" => format!("LTCG-{game}"),
                "debug" => format!("DEBUG-{game}"),
                "release-g4wlive" => format!("{game}-G4WLive"),
                "releaseltcg-g4wlive" => format!("{game}LTCG-G4WLive"),
                "releaseshippingpc" | "shipping" if game.eq_ignore_ascii_case("UTGame") => "UT3".to_string(),
                "releaseshippingpc" | "shipping" => format!("ShippingPC-{game}"),
                _ => return None,
            };
            Some((format!("Binaries/{stem}.exe"), format!("Binaries/Lib/{config}/{stem}.pdb")))
        }
        "xenon" => Some((
            format!("{game}-{config}.exe"),
            format!("Binaries/Xenon/lib/{config}/{game}-{config}.pdb"),
        )),
        _ => None,
    }
}

fn quoted(path: &Path) -> String {
    let text = path.display().to_string();
    if text.contains(' ') {
        format!("\"{text}\"")
    } else {
        text
    }
}

/// Steps that store `binaries` under `upload`. Without binaries the plan only
/// clears stale index files.
pub fn plan(root: &Path, binaries: Option<(String, String)>, upload: &SymbolUpload) -> VecDeque<SymStoreStep> {
    let mut steps = VecDeque::new();
    if let Some((exe, pdb)) = binaries {
        steps.push_back(SymStoreStep::DeleteIndexes);
        steps.push_back(SymStoreStep::Status(exe.clone()));

        let title = format!("UnrealEngine3-{}", upload.platform);
        let mut index = Vec::new();
        let mut store = Vec::new();
        for (file, index_file) in [(root.join(&exe), EXE_INDEX), (root.join(&pdb), PDB_INDEX)] {
            let dir = quoted(file.parent().unwrap_or(root));
            index.push(format!("add /g {dir} /p /l /f {} /x {index_file} /a /o", quoted(&file)));
            store.push(format!(
                "add /g {dir} /y {index_file} /l /s {} /t {title} /v {} /c {} /o /compress",
                upload.store, upload.changelist, upload.version
            ));
        }
        steps.extend(index.into_iter().chain(store).map(SymStoreStep::Run));
    }
    steps.push_back(SymStoreStep::DeleteIndexes);
    steps
}

pub fn delete_indexes(root: &Path) -> std::io::Result<()> {
    for index in [EXE_INDEX, PDB_INDEX] {
        let path = root.join(index);
        if path.exists() {
            files::set_read_only(root, index, false)?;
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}
