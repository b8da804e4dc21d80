//! Local filesystem actions.
//!
//! Paths in a command line are relative to the branch workspace unless they
//! are absolute. File specs may end in `...` (everything below a directory)
//! or carry `*`/`?` wildcards in their last component.

use buildfarm_config::ScriptState;
use buildfarm_config::script::extract_parameters;
use buildfarm_core::Command;
use chrono::Utc;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::logbook::CommandLog;

pub(super) type Step = std::result::Result<(), String>;

pub(super) fn execute(command: Command, state: &mut ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    match command {
        Command::Clean => clean(state, root, log),
        Command::Cleanup => cleanup(state, root, log),
        Command::ShaderClean => {
            delete_shader_caches(state, root, log);
            Ok(())
        }
        Command::SimpleCopy => simple_copy(state, root, log),
        Command::SimpleDelete => simple_delete(state, root, log),
        Command::SimpleRename => simple_rename(state, root, log),
        Command::RenamedCopy => renamed_copy(state, root, log),
        Command::GetEngineVersion => get_engine_version(state, root, log),
        Command::BumpEngineVersion => bump_engine_version(state, root, log),
        Command::SourceBuildCopy => source_build_copy(state, root, log),
        Command::PreHeatMapOven => preheat_map_oven(state, root, log),
        Command::PreHeatDlc => preheat_dlc(state, root, log),
        Command::UpdateGdfVersion => update_gdf_version(state, root, log),
        other => Err(format!("{other} is not a filesystem action")),
    }
}

/// Files matched by a spec under `root`.
pub fn expand_spec(root: &Path, spec: &str) -> Vec<PathBuf> {
    let spec = spec.trim();
    if let Some(dir) = spec.strip_suffix("...") {
        let mut files = Vec::new();
        collect_files(&root.join(dir), &mut files);
        return files;
    }

    let path = root.join(spec);
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name.contains(['*', '?']) {
        let Some(pattern) = wildcard(name) else {
            return Vec::new();
        };
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
        let Ok(entries) = fs::read_dir(&parent) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| pattern.is_match(n))
            })
            .collect();
        files.sort();
        return files;
    }

    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(&path, &mut files);
        files
    } else if path.exists() {
        vec![path]
    } else {
        Vec::new()
    }
}

fn wildcard(name: &str) -> Option<Regex> {
    let pattern = regex::escape(name).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("(?i)^{pattern}$")).ok()
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_files(&path, files);
        } else {
            files.push(path);
        }
    }
}

/// Set or clear the read-only flag on every file a spec matches.
pub fn set_read_only(root: &Path, spec: &str, read_only: bool) -> std::io::Result<usize> {
    let files = expand_spec(root, spec);
    for file in &files {
        set_file_read_only(file, read_only)?;
    }
    Ok(files.len())
}

fn set_file_read_only(path: &Path, read_only: bool) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    if permissions.readonly() != read_only {
        permissions.set_readonly(read_only);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

fn is_read_only(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.permissions().readonly())
}

fn remove(path: &Path, branch: &str, display: &str, log: &mut CommandLog) -> std::io::Result<()> {
    log.write(&format!("Deleting: '{branch}/{display}'"));
    if path.is_dir() {
        fs::remove_dir_all(path)?;
        log.write(" ... done");
    } else if path.exists() {
        set_file_read_only(path, false)?;
        fs::remove_file(path)?;
        log.write(" ... done");
    }
    Ok(())
}

fn clean(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let folder = "Development/Intermediate";
    remove(&root.join(folder), &state.branch, folder, log).map_err(|e| format!("while cleaning up: '{e}'"))
}

fn cleanup(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    log.write(&format!("Cleaning up branch: '{}'", state.branch));
    let cooked = format!("{}Game/Cooked{}", state.label.game, state.label.platform);
    remove(&root.join(&cooked), &state.branch, &cooked, log).map_err(|e| format!("while cleaning up: '{e}'"))?;
    delete_shader_caches(state, root, log);
    Ok(())
}

fn shader_platforms(platform: &str) -> Vec<String> {
    let mut platforms = vec![platform.to_string()];
    if platform.eq_ignore_ascii_case("pc") {
        platforms.push("PC_SM2".to_string());
        platforms.push("PC_SM4".to_string());
    }
    platforms
}

fn delete_shader_caches(state: &ScriptState, root: &Path, log: &mut CommandLog) {
    let game = &state.label.game;
    for platform in shader_platforms(&state.label.platform) {
        for cache in [
            format!("{game}Game/Content/GlobalShaderCache-{platform}.bin"),
            format!("{game}Game/Content/LocalShaderCache-{platform}.upk"),
        ] {
            if let Err(e) = remove(&root.join(&cache), &state.branch, &cache, log) {
                log.write(&format!("Warning, could not delete '{cache}': {e}"));
            }
        }
    }
}

fn simple_copy(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let name = state.command_line.trim();
    log.write(&format!("Copying: {name}"));
    log.write(&format!(" ... to: {}", state.copy_destination));
    if state.copy_destination.is_empty() {
        return Err("no copy destination set".to_string());
    }

    let source = root.join(name);
    if !source.is_file() {
        return Err("source file does not exist for copying".to_string());
    }
    let dest_dir = root.join(&state.copy_destination);
    let mut copy = || -> std::io::Result<()> {
        if !dest_dir.exists() {
            log.write(&format!(" ... creating: {}", dest_dir.display()));
            fs::create_dir_all(&dest_dir)?;
        }
        let file_name = source.file_name().unwrap_or_default();
        let dest = dest_dir.join(file_name);
        if dest.exists() {
            log.write(&format!(" ... deleting: {}", dest.display()));
            set_file_read_only(&dest, false)?;
            fs::remove_file(&dest)?;
        }
        fs::copy(&source, &dest)?;
        Ok(())
    };
    copy().map_err(|e| format!("exception copying file: {e}"))
}

fn source_build_copy(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let name = state.command_line.trim();
    let source = root.join(&state.source_build).join(&state.branch).join(name);
    let dest = root.join(name);
    log.write("Copying: ");
    log.write(&format!(" ... from: {}", source.display()));
    log.write(&format!(" ... to: {name}"));
    if state.source_build.is_empty() {
        return Err("no source build set".to_string());
    }
    if !source.is_file() {
        return Err("source file does not exist for copying".to_string());
    }

    let mut copy = || -> std::io::Result<()> {
        if dest.exists() {
            set_file_read_only(&dest, false)?;
        }
        if let Some(parent) = dest.parent().filter(|p| !p.exists()) {
            log.write(&format!(" ... creating: {}", parent.display()));
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &dest)?;
        Ok(())
    };
    copy().map_err(|e| format!("exception copying file from alternate build: {e}"))
}

/// Delete the files directly inside `folder` whose names match `pattern`.
fn remove_matching(state: &ScriptState, root: &Path, folder: &str, pattern: &str, log: &mut CommandLog) -> Step {
    log.write(&format!("Deleting '{pattern}' from: '{}/{folder}'", state.branch));
    for file in expand_spec(root, &format!("{folder}/{pattern}")) {
        set_file_read_only(&file, false)
            .and_then(|()| fs::remove_file(&file))
            .map_err(|e| format!("exception deleting '{}': {e}", file.display()))?;
    }
    Ok(())
}

fn preheat_map_oven(state: &mut ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    if !state.command_line.trim().is_empty() {
        return Err("too many parameters. Usage: PreheatMapOven.".to_string());
    }
    if state.label.game.is_empty() {
        return Err("no game defined for PreheatMapOven".to_string());
    }

    let game = format!("{}Game", state.label.game);
    let platform = &state.label.platform;
    for folder in [format!("{game}/Cooked{platform}"), format!("{game}/Config/{platform}/Cooked")] {
        remove(&root.join(&folder), &state.branch, &folder, log)
            .map_err(|e| format!("exception while cleaning cooked data: {e}"))?;
    }
    // Stale tables of contents and coalesced ini files.
    remove_matching(state, root, &game, "*.txt", log)?;
    remove_matching(state, root, &format!("{game}/Localization"), "Coalesced*", log)?;
    delete_shader_caches(state, root, log);

    log.write("Deleting ini files");
    clean_ini_files(&root.join(&game).join("Config"), log)
        .map_err(|e| format!("exception while deleting ini files: {e}"))?;

    state.publish_destinations.clear();
    Ok(())
}

/// Delete every writable file directly inside the config folder; read-only
/// files are the checked-in defaults.
fn clean_ini_files(folder: &Path, log: &mut CommandLog) -> std::io::Result<()> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Ok(());
    };
    for path in entries.flatten().map(|e| e.path()).filter(|p| p.is_file()) {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        log.write(&format!(" ... checking: {name}"));
        if !is_read_only(&path) {
            fs::remove_file(&path)?;
            log.write(&format!(" ...... deleted: {name}"));
        }
    }
    Ok(())
}

fn preheat_dlc(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    if !state.command_line.trim().is_empty() {
        return Err("too many parameters. Usage: PreheatDLC.".to_string());
    }
    if state.label.game.is_empty() {
        return Err("no game defined for PreheatDLC".to_string());
    }
    if state.mod_name.is_empty() {
        return Err("no modname defined for PreheatDLC".to_string());
    }

    let platform = &state.label.platform;
    let dlc = format!("{}Game/DLC/{platform}/{}", state.label.game, state.mod_name);
    for folder in [format!("{dlc}/Cooked{platform}"), format!("{dlc}/Online")] {
        remove(&root.join(&folder), &state.branch, &folder, log)
            .map_err(|e| format!("exception while cleaning DLC data: {e}"))?;
    }
    Ok(())
}

fn update_gdf_version(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let params = extract_parameters(&state.command_line);
    let [game, resources] = params.as_slice() else {
        return Err("too few parameters. Usage: UpdateGDFVersion <Game> <ResourcePath>.".to_string());
    };
    for language in &state.languages {
        let file = format!("{resources}/{language}/{game}Game.gdf.xml");
        bump_misc_version(state, root, &file, log)?;
    }
    Ok(())
}

fn simple_delete(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let name = state.command_line.trim();
    log.write(&format!("Deleting: {name}"));
    let path = root.join(name);
    if !path.is_file() {
        return Err("source file does not exist for deletion".to_string());
    }
    fs::remove_file(&path).map_err(|e| format!("exception deleting file: {e}"))
}

fn two_params(state: &ScriptState, action: &str) -> std::result::Result<(String, String), String> {
    match extract_parameters(&state.command_line).as_slice() {
        [from, to] => Ok((from.clone(), to.clone())),
        _ => Err(format!("while {action} file (wrong number of parameters)")),
    }
}

fn simple_rename(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let (from, to) = two_params(state, "renaming")?;
    let base = if state.copy_destination.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&state.copy_destination).join(&state.branch)
    };
    let source = base.join(&from);
    let dest = base.join(&to);
    log.write("Renaming: ");
    log.write(&format!(" ... from: {}", source.display()));
    log.write(&format!(" ... to: {}", dest.display()));
    if !source.is_file() {
        return Err("source file does not exist for renaming".to_string());
    }

    let rename = || -> std::io::Result<()> {
        if dest.exists() {
            set_file_read_only(&dest, false)?;
            fs::remove_file(&dest)?;
        }
        set_file_read_only(&source, false)?;
        fs::copy(&source, &dest)?;
        fs::remove_file(&source)
    };
    rename().map_err(|e| format!("exception renaming file: {e}"))
}

fn renamed_copy(state: &ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    let (from, to) = two_params(state, "renaming and copying")?;
    let source = root.join(&from);
    let dest = root.join(&to);
    log.write("Renaming and copying: ");
    log.write(&format!(" ... from: {from}"));
    log.write(&format!(" ... to: {to}"));
    if !source.is_file() {
        return Err("source file does not exist for renaming and copying".to_string());
    }
    if dest.exists() && is_read_only(&dest) {
        return Err("destination file is read only".to_string());
    }

    let mut copy = || -> std::io::Result<()> {
        if dest.exists() {
            log.write(&format!(" ... deleting: {}", dest.display()));
            fs::remove_file(&dest)?;
        } else if let Some(parent) = dest.parent() {
            log.write(&format!(" ... creating: {}", parent.display()));
            fs::create_dir_all(parent)?;
        }
        set_file_read_only(&source, false)?;
        fs::copy(&source, &dest)?;
        Ok(())
    };
    copy().map_err(|e| format!("exception renaming and copying file: {e}"))
}

fn define_value(line: &str, name: &str) -> Option<i64> {
    match line.split([' ', '\t']).collect::<Vec<_>>().as_slice() {
        [define, key, value] if define.eq_ignore_ascii_case("#define") && key.eq_ignore_ascii_case(name) => {
            value.trim().parse().ok()
        }
        _ => None,
    }
}

fn get_engine_version(state: &mut ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    if state.version_file.is_empty() {
        return Err("no version file set".to_string());
    }
    let path = root.join(&state.version_file);
    let text = fs::read_to_string(&path)
        .map_err(|e| format!("while getting engine version in '{}': {e}", state.version_file))?;
    let version = text.lines().find_map(|l| define_value(l, "ENGINE_VERSION")).unwrap_or(0);
    state.label.build_version = version;
    log.write(&format!("Engine version: {version}"));
    Ok(())
}

fn bump_engine_version(state: &mut ScriptState, root: &Path, log: &mut CommandLog) -> Step {
    if state.version_file.is_empty() {
        return Err("no version file set".to_string());
    }
    let increment = state.command_line.trim().parse::<i64>().unwrap_or(1);

    let path = root.join(&state.version_file);
    let text = read_writable(&path, &state.version_file)?;
    let mut bumped = Vec::new();
    for line in text.lines() {
        if let Some(version) = define_value(line, "ENGINE_VERSION") {
            state.label.build_version = version + increment;
            bumped.push(format!("#define ENGINE_VERSION {}", state.label.build_version));
        } else if define_value(line, "BUILT_FROM_CHANGELIST").is_some() {
            bumped.push(format!("#define BUILT_FROM_CHANGELIST {}", state.label.changelist));
        } else {
            bumped.push(line.to_string());
        }
    }
    write_lines(&path, &bumped, &state.version_file)?;
    log.write(&format!("Engine version bumped to {}", state.label.build_version));

    for file in state.misc_version_files.clone() {
        bump_misc_version(state, root, &file, log)?;
    }
    Ok(())
}

/// Game definition files are stored as UTF-16 with a byte-order mark.
fn is_wide(display: &str) -> bool {
    display.to_lowercase().ends_with(".gdf.xml")
}

fn decode(bytes: &[u8]) -> Option<String> {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).ok()
        }
        _ => String::from_utf8(bytes.to_vec()).ok(),
    }
}

fn read_writable(path: &Path, display: &str) -> std::result::Result<String, String> {
    if is_read_only(path) {
        return Err(format!("version file is read only '{display}'"));
    }
    let bytes = fs::read(path).map_err(|e| format!("failed to open for reading '{display}': {e}"))?;
    decode(&bytes).ok_or_else(|| format!("failed to decode '{display}'"))
}

fn write_lines(path: &Path, lines: &[String], display: &str) -> Step {
    let mut text = lines.join("\n");
    text.push('\n');
    let bytes = if is_wide(display) {
        let mut wide = vec![0xFF, 0xFE];
        wide.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
        wide
    } else {
        text.into_bytes()
    };
    fs::write(path, bytes).map_err(|e| format!("failed to write '{display}': {e}"))
}

fn bump_misc_version(state: &ScriptState, root: &Path, file: &str, log: &mut CommandLog) -> Step {
    let path = root.join(file);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let text = read_writable(&path, file)?;
    let version = state.label.build_version;

    let bump: Box<dyn Fn(&str) -> Option<String>> = match extension.as_str() {
        "xml" => Box::new(move |line: &str| {
            line.trim_start()
                .starts_with("build=")
                .then(|| format!("     build=\"{version}\""))
        }),
        "h" => Box::new(move |line: &str| {
            line.trim_start()
                .starts_with("#define BUILD_NUM")
                .then(|| format!("#define BUILD_NUM {version}"))
        }),
        "properties" => {
            let stamp = Utc::now().format("%Y-%m-%d_%H.%M").to_string();
            let changelist = state.label.changelist;
            Box::new(move |line: &str| {
                let line = line.trim_start();
                if line.starts_with("timestampForBVT=") {
                    Some(format!("timestampForBVT={stamp}"))
                } else if line.starts_with("changelistBuiltFrom=") {
                    Some(format!("changelistBuiltFrom={changelist}"))
                } else {
                    None
                }
            })
        }
        _ => return Err(format!("invalid extension for '{file}'")),
    };

    let lines: Vec<String> = text
        .lines()
        .map(|line| bump(line).unwrap_or_else(|| line.to_string()))
        .collect();
    write_lines(&path, &lines, file)?;
    log.write(&format!("Bumped version in '{file}'"));
    Ok(())
}
