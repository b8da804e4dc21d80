//! Source-control actions.

use buildfarm_config::script::{RevisionType, extract_parameters};
use buildfarm_config::tools::render_template;
use buildfarm_config::ScriptState;
use buildfarm_core::{Command, Revision, SubmitOutcome, Workspace};
use std::collections::VecDeque;

use super::files::{self, Step};
use super::Dispatcher;
use crate::logbook::CommandLog;

const EVERYTHING: &str = "...";

/// Content a sync refreshes to head for artists, after the main sync.
const ARTIST_CONTENT: &[&str] = &[
    "{game}Game/__Trashcan/...",
    "{game}Game/Content/...",
    "{game}Game/Localization/...",
    "{game}Game/Content/Interface/...",
];

/// Revision a run builds from: its label, else its changelist, else head.
pub fn sync_revision(state: &ScriptState) -> Revision {
    if state.label.revision_type == RevisionType::Label {
        Revision::Label(state.label_name())
    } else if state.label.changelist != 0 {
        Revision::ChangeList(state.label.changelist)
    } else {
        Revision::Head
    }
}

fn message(e: buildfarm_core::Error) -> String {
    e.to_string()
}

/// The file a localized checkout opens for one language. `None` when the
/// parameters do not fit the command.
fn localized_file(command: Command, params: &[String], language: &str) -> Option<String> {
    let suffix = if language == "INT" {
        String::new()
    } else {
        format!("_{language}")
    };
    match (command, params) {
        (Command::CheckoutDialog, [game, root]) => {
            Some(format!("{game}Game/Content/Sounds/{language}/{root}{suffix}.upk"))
        }
        (Command::CheckoutFonts, [game, root]) => Some(format!("{game}Game/Content/{root}{suffix}.upk")),
        (Command::CheckoutLocPackage, [root]) => Some(format!("{root}{suffix}.upk")),
        (Command::CheckoutGdf, [game, resources]) => Some(format!("{resources}/{language}/{game}Game.gdf.xml")),
        _ => None,
    }
}

impl Dispatcher {
    pub(super) async fn source_control(&self, command: Command, state: &mut ScriptState, log: &mut CommandLog) -> Step {
        let ws = self.workspace(state);
        let spec = render_template(&state.command_line, &[], &state.placeholders());
        let spec = spec.trim();
        let scc = self.deps.scc.as_ref();

        match command {
            Command::Sync => self.sync(&ws, state, log).await,
            Command::ArtistSync => {
                self.sync(&ws, state, log).await?;
                let values = state.placeholders();
                for template in ARTIST_CONTENT {
                    let content = render_template(template, &[], &values);
                    log.write(&format!("Syncing '{content}' to #head"));
                    scc.sync(&ws, &content, &Revision::Head).await.map_err(message)?;
                }
                let shaders = render_template("{game}Game/Content/RefShaderCache...", &[], &values);
                scc.sync(&ws, &shaders, &sync_revision(state)).await.map_err(message)?;
                Ok(())
            }
            Command::GetChanges => {
                state.synced_label = sync_revision(state).to_string();
                if state.last_good_changelist != 0 {
                    self.collect_changes(&ws, state, log).await?;
                }
                Ok(())
            }
            Command::SyncSingleChangeList => {
                let changelist: i64 = spec
                    .parse()
                    .map_err(|_| format!("invalid changelist '{spec}'"))?;
                log.write(&format!("Syncing the files of changelist {changelist}"));
                scc.sync_change(&ws, changelist).await.map_err(message)
            }
            Command::Checkout => {
                let opened = scc.checkout(&ws, spec).await.map_err(message)?;
                log.write(&format!("Checked out {opened} file(s) matching '{spec}'"));
                if opened > 0 {
                    state.flags.files_checked_out = true;
                }
                Ok(())
            }
            Command::CheckoutDialog | Command::CheckoutFonts | Command::CheckoutLocPackage | Command::CheckoutGdf => {
                self.checkout_localized(command, &ws, spec, state, log).await
            }
            Command::OpenForDelete => {
                let opened = scc.open_for_delete(&ws, spec).await.map_err(message)?;
                log.write(&format!("Opened {opened} file(s) for delete matching '{spec}'"));
                if opened > 0 {
                    state.flags.files_checked_out = true;
                }
                Ok(())
            }
            Command::MakeWritable => {
                let count = files::set_read_only(&ws.root, spec, false)
                    .map_err(|e| format!("exception while making files writable: {e}"))?;
                log.write(&format!("Made {count} file(s) writable matching '{spec}'"));
                state.made_writable.push(spec.to_string());
                Ok(())
            }
            Command::Submit => self.submit(&ws, state, log).await,
            Command::CreateNewLabel => {
                let label = state.label_name();
                let revision = match state.label.changelist {
                    0 => Revision::Head,
                    cl => Revision::ChangeList(cl),
                };
                log.write(&format!("Creating label '{label}' at {revision}"));
                scc.create_label(&ws, &label, &state.label.description(), &revision)
                    .await
                    .map_err(message)?;
                state.flags.new_label_created = true;
                state.dependency = label;
                Ok(())
            }
            Command::UpdateLabelDescription => {
                let label = state.label_name();
                log.write(&format!("Updating description of label '{label}'"));
                scc.update_label_description(&ws, &label, &state.label.description())
                    .await
                    .map_err(message)
            }
            Command::Revert => {
                log.write("[STATUS] Reverting: '...'");
                scc.revert(&ws, EVERYTHING).await.map_err(message)?;
                state.flags.files_checked_out = false;
                Ok(())
            }
            Command::RevertFile => {
                log.write(&format!("Reverting: '{spec}'"));
                scc.revert(&ws, spec).await.map_err(message)
            }
            Command::Tag => {
                if spec.is_empty() {
                    return Err("no label given to tag to".to_string());
                }
                let source = self.existing_label(&ws, state).await?;
                log.write(&format!("Deleting label '{spec}'"));
                if let Err(e) = scc.delete_label(&ws, spec).await {
                    log.write(&format!(" ... {e}"));
                }
                log.write(&format!("Tagging '{spec}' from @{source}"));
                scc.tag(&ws, EVERYTHING, spec, &Revision::Label(source))
                    .await
                    .map_err(message)
            }
            Command::TagFile => {
                let label = self.existing_label(&ws, state).await?;
                let revision = match state.label.changelist {
                    0 => Revision::Head,
                    cl => Revision::ChangeList(cl),
                };
                log.write(&format!("Tagging '{spec}' into '{label}'"));
                scc.tag(&ws, spec, &label, &revision).await.map_err(message)
            }
            Command::CheckConsistency => {
                let spec = if spec.is_empty() { EVERYTHING } else { spec };
                let inconsistent = scc.inconsistent_files(&ws, spec).await.map_err(message)?;
                for file in &inconsistent {
                    log.write(&format!("Error: Depot version of '{file}' is inconsistent with local version!"));
                }
                if inconsistent.is_empty() {
                    Ok(())
                } else {
                    Err(format!("{} file(s) inconsistent with the depot", inconsistent.len()))
                }
            }
            other => Err(format!("{other} is not a source control action")),
        }
    }

    /// Check out one file per language. Missing files are skipped; the
    /// languages that had a file become the queue `conform` works through.
    async fn checkout_localized(
        &self,
        command: Command,
        ws: &Workspace,
        spec: &str,
        state: &mut ScriptState,
        log: &mut CommandLog,
    ) -> Step {
        let params = extract_parameters(spec);
        if localized_file(command, &params, "INT").is_none() {
            return Err(format!("incorrect number of parameters for {command}"));
        }

        let mut found = VecDeque::new();
        for language in state.languages.clone() {
            let Some(file) = localized_file(command, &params, &language) else {
                continue;
            };
            match self.deps.scc.checkout(ws, &file).await {
                Ok(0) => log.write(&format!("Nothing to check out for '{file}'")),
                Ok(_) => {
                    log.write(&format!("Checked out '{file}'"));
                    state.flags.files_checked_out = true;
                    found.push_back(language);
                }
                Err(e) => log.write(&format!("Could not check out '{file}': {e}")),
            }
        }

        if command != Command::CheckoutGdf {
            state.languages = found;
        }
        Ok(())
    }

    async fn sync(&self, ws: &Workspace, state: &mut ScriptState, log: &mut CommandLog) -> Step {
        let revision = sync_revision(state);
        let pinned = state.label.revision_type == RevisionType::ChangeList;
        state.synced_label = revision.to_string();

        log.write(&format!("Syncing '{EVERYTHING}' to {revision}"));
        let synced = self.deps.scc.sync(ws, EVERYTHING, &revision).await.map_err(message)?;
        if revision == Revision::Head {
            state.label.changelist = synced;
        }
        log.write(&format!("Synced to changelist {synced}"));

        if !pinned && !state.is_job && state.last_good_changelist != 0 {
            self.collect_changes(ws, state, log).await?;
        }
        Ok(())
    }

    async fn collect_changes(&self, ws: &Workspace, state: &mut ScriptState, log: &mut CommandLog) -> Step {
        let upper = state.label.changelist;
        let changes = self
            .deps
            .scc
            .changes_since(ws, state.last_good_changelist)
            .await
            .map_err(message)?;
        state.changes = changes
            .into_iter()
            .filter(|c| upper == 0 || c.changelist <= upper)
            .collect();
        log.write(&format!(
            "Found {} change(s) since changelist {}",
            state.changes.len(),
            state.last_good_changelist
        ));
        Ok(())
    }

    async fn submit(&self, ws: &Workspace, state: &mut ScriptState, log: &mut CommandLog) -> Step {
        if !state.flags.files_checked_out {
            return Err("no files are checked out to submit".to_string());
        }
        let description = format!(
            "[BUILDER] '{}' built from changelist {}",
            state.description, state.label.changelist
        );

        let scc = self.deps.scc.as_ref();
        let mut outcome = scc.submit(ws, &description).await.map_err(message)?;
        if let SubmitOutcome::NeedsResolve { files } = &outcome {
            log.write(&format!("Submit needs {} file(s) resolved; resolving", files.len()));
            scc.resolve(ws).await.map_err(message)?;
            outcome = scc.submit(ws, &description).await.map_err(message)?;
        }

        match outcome {
            SubmitOutcome::Submitted { changelist } => {
                log.write(&format!("Submitted changelist {changelist}"));
                state.flags.files_checked_out = false;
                Ok(())
            }
            SubmitOutcome::NeedsResolve { files } => Err(format!(
                "submit still needs resolve after retry: {}",
                files.join(", ")
            )),
        }
    }

    /// The label a tag reads from; it must already exist.
    async fn existing_label(&self, ws: &Workspace, state: &ScriptState) -> Result<String, String> {
        let Revision::Label(label) = sync_revision(state) else {
            return Err("non existent label, cannot tag to #head".to_string());
        };
        match self.deps.scc.label(ws, &label).await.map_err(message)? {
            Some(_) => Ok(label),
            None => Err(format!("non existent label, cannot tag to: {label}")),
        }
    }
}
