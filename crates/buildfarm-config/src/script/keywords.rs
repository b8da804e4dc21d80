//! Keyword table for the build-script language.
//!
//! Every keyword maps to an [`Entry`]: an optional configuration directive
//! applied to the script state, the abstract command handed to the state
//! machine, an optional run flag the command raises, and an optional file
//! spec template for source-control shorthands such as `checkoutgame`.

use buildfarm_core::Command;
use std::collections::HashMap;
use std::sync::LazyLock;

/// State mutations performed by the interpreter itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Status,
    WatchStart,
    WatchStop,
    CheckErrors(bool),
    CheckWarnings(bool),
    LanguageSpecific(bool),
    CreateLabel,
    Report,
    TriggerAddress,
    FailAddress,
    SuccessAddress,
    SmsAddress,
    Define,
    Language,
    Languages,
    ClientSpec,
    Timeout,
    RespondingTimeout,
    Application(&'static str),
    Ps3Sdk,
    VersionFile,
    MiscVersionFiles,
    Game,
    Platform,
    BuildConfig,
    ScriptConfig,
    CookConfig,
    ModName,
    InstallConfig,
    ContentPath,
    CompressionConfig,
    Dependency,
    SourceBuild,
    CopyDest,
    BlockOnPublish,
    ForceCopy,
    Unity,
}

/// Flags an action raises on the run when it is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFlag {
    Promoting,
    Building,
    MakingInstall,
    Publishing,
    SendingQaChanges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub directive: Option<Directive>,
    pub command: Command,
    pub flag: Option<RunFlag>,
    pub spec: Option<&'static str>,
}

const fn directive(directive: Directive) -> Entry {
    Entry {
        directive: Some(directive),
        command: Command::Config,
        flag: None,
        spec: None,
    }
}

const fn action(command: Command) -> Entry {
    Entry {
        directive: None,
        command,
        flag: None,
        spec: None,
    }
}

const fn flagged(command: Command, flag: RunFlag) -> Entry {
    Entry {
        directive: None,
        command,
        flag: Some(flag),
        spec: None,
    }
}

const fn scoped(command: Command, spec: &'static str) -> Entry {
    Entry {
        directive: None,
        command,
        flag: None,
        spec: Some(spec),
    }
}

const fn setter(directive: Directive, command: Command) -> Entry {
    Entry {
        directive: Some(directive),
        command,
        flag: None,
        spec: None,
    }
}

const TABLE: &[(&str, Entry)] = &[
    // Directives.
    ("status", directive(Directive::Status)),
    ("watchstart", directive(Directive::WatchStart)),
    ("watchstop", directive(Directive::WatchStop)),
    ("checkerrors", directive(Directive::CheckErrors(true))),
    ("ignoreerrors", directive(Directive::CheckErrors(false))),
    ("checkwarnings", directive(Directive::CheckWarnings(true))),
    ("ignorewarnings", directive(Directive::CheckWarnings(false))),
    ("languagespecific", directive(Directive::LanguageSpecific(true))),
    ("languageagnostic", directive(Directive::LanguageSpecific(false))),
    ("createlabel", directive(Directive::CreateLabel)),
    ("report", directive(Directive::Report)),
    ("failaddress", directive(Directive::FailAddress)),
    ("successaddress", directive(Directive::SuccessAddress)),
    ("sms", directive(Directive::SmsAddress)),
    ("define", directive(Directive::Define)),
    ("language", directive(Directive::Language)),
    ("languages", directive(Directive::Languages)),
    ("clientspec", directive(Directive::ClientSpec)),
    ("timeout", directive(Directive::Timeout)),
    ("respondingtimeout", directive(Directive::RespondingTimeout)),
    ("msvcapplication", directive(Directive::Application("msvc"))),
    ("msapplication", directive(Directive::Application("msbuild"))),
    ("makeapplication", directive(Directive::Application("make"))),
    ("isdevlocation", directive(Directive::Application("isdev"))),
    ("symbolstoreapplication", directive(Directive::Application("symstore"))),
    ("signtoolapplication", directive(Directive::Application("signtool"))),
    ("sourceservercommand", directive(Directive::Application("sourceserver"))),
    ("symbolstorelocation", directive(Directive::Application("symbolstore"))),
    ("useps3sdk", directive(Directive::Ps3Sdk)),
    ("versionfile", directive(Directive::VersionFile)),
    ("miscversionfiles", directive(Directive::MiscVersionFiles)),
    ("game", directive(Directive::Game)),
    ("platform", directive(Directive::Platform)),
    ("buildconfig", directive(Directive::BuildConfig)),
    ("scriptconfig", directive(Directive::ScriptConfig)),
    ("cookconfig", directive(Directive::CookConfig)),
    ("modname", directive(Directive::ModName)),
    ("installconfig", directive(Directive::InstallConfig)),
    ("contentpath", directive(Directive::ContentPath)),
    ("compressionconfig", directive(Directive::CompressionConfig)),
    ("sourcebuild", directive(Directive::SourceBuild)),
    ("copydest", directive(Directive::CopyDest)),
    ("blockonpublish", directive(Directive::BlockOnPublish)),
    ("forcecopy", directive(Directive::ForceCopy)),
    ("unity", directive(Directive::Unity)),
    ("sendqachanges", flagged(Command::Config, RunFlag::SendingQaChanges)),
    // Pseudo-commands handled by the state machine.
    ("triggeraddress", setter(Directive::TriggerAddress, Command::TriggerMail)),
    ("redflash", setter(Directive::SmsAddress, Command::RedFlash)),
    ("dependency", setter(Directive::Dependency, Command::SetDependency)),
    ("wait", action(Command::Wait)),
    ("waitforjobs", action(Command::WaitForJobs)),
    ("trigger", action(Command::Trigger)),
    ("updatelabel", action(Command::UpdateLabel)),
    ("updatefolder", action(Command::UpdateFolder)),
    ("checkspace", action(Command::CheckSpace)),
    ("msvcfull", action(Command::MsvcFull)),
    ("gccfull", action(Command::GccFull)),
    ("shaderfull", action(Command::ShaderFull)),
    // Source control.
    ("sync", action(Command::Sync)),
    ("artistsync", action(Command::ArtistSync)),
    ("getchanges", action(Command::GetChanges)),
    ("syncsinglechangelist", action(Command::SyncSingleChangeList)),
    ("checkout", action(Command::Checkout)),
    ("checkoutgame", scoped(Command::Checkout, "Binaries/{platform}/{game}Game*")),
    ("checkoutshader", scoped(Command::Checkout, "{game}Game/Content/*ShaderCache*{platform}*")),
    ("checkoutcontenttag", scoped(Command::Checkout, "{game}Game/Content/GameContentTags.upk")),
    ("checkoutlayout", scoped(Command::Checkout, "{game}Game/Build/{platform}/Layout.xml")),
    ("checkouthashes", scoped(Command::Checkout, "{game}Game/Build/Hashes.sha")),
    ("checkoutdialog", action(Command::CheckoutDialog)),
    ("checkoutfonts", action(Command::CheckoutFonts)),
    ("checkoutlocpackage", action(Command::CheckoutLocPackage)),
    ("checkoutgdf", action(Command::CheckoutGdf)),
    ("openfordelete", action(Command::OpenForDelete)),
    ("makewritable", action(Command::MakeWritable)),
    ("submit", flagged(Command::Submit, RunFlag::Building)),
    ("createnewlabel", action(Command::CreateNewLabel)),
    ("updatelabeldescription", action(Command::UpdateLabelDescription)),
    ("revert", action(Command::Revert)),
    ("revertfile", action(Command::RevertFile)),
    ("tag", flagged(Command::Tag, RunFlag::Promoting)),
    ("tagfile", action(Command::TagFile)),
    ("tagexe", scoped(Command::TagFile, "Binaries/{platform}/{game}Game*")),
    ("tagcontenttag", scoped(Command::TagFile, "{game}Game/Content/GameContentTags.upk")),
    ("taglayout", scoped(Command::TagFile, "{game}Game/Build/{platform}/Layout.xml")),
    ("tagpcs", scoped(Command::TagFile, "{game}Game/Content/RefShaderCache-{shadersuffix}.upk")),
    ("checkconsistency", action(Command::CheckConsistency)),
    // Filesystem.
    ("clean", action(Command::Clean)),
    ("cleanup", action(Command::Cleanup)),
    ("shaderclean", action(Command::ShaderClean)),
    ("copy", action(Command::SimpleCopy)),
    ("sourcebuildcopy", action(Command::SourceBuildCopy)),
    ("delete", action(Command::SimpleDelete)),
    ("rename", action(Command::SimpleRename)),
    ("renamecopy", action(Command::RenamedCopy)),
    ("bumpengineversion", action(Command::BumpEngineVersion)),
    ("getengineversion", action(Command::GetEngineVersion)),
    ("updategdfversion", action(Command::UpdateGdfVersion)),
    ("preheatmapoven", action(Command::PreHeatMapOven)),
    ("preheatdlc", action(Command::PreHeatDlc)),
    // Sub-jobs.
    ("addjob", action(Command::AddJob)),
    ("addunrealgamejob", action(Command::AddUnrealGameJob)),
    ("addunrealfullgamejob", action(Command::AddUnrealFullGameJob)),
    // External tools.
    ("msbuild", action(Command::MsBuild)),
    ("unrealbuild", action(Command::UnrealBuild)),
    ("msvcclean", action(Command::MsvcClean)),
    ("msvcbuild", action(Command::MsvcBuild)),
    ("gccclean", action(Command::GccClean)),
    ("gccbuild", action(Command::GccBuild)),
    ("shaderbuild", action(Command::ShaderBuild)),
    ("shaderbuildstate", action(Command::ShaderBuildState)),
    ("makepatch", action(Command::MakePatch)),
    ("makepatchbinary", action(Command::MakePatchBinary)),
    ("ps3makepatch", action(Command::MakePatch)),
    ("ps3makepatchbinary", action(Command::MakePatchBinary)),
    ("buildscript", action(Command::BuildScript)),
    ("cookmaps", action(Command::CookMaps)),
    ("cooksounds", action(Command::CookSounds)),
    ("createhashes", action(Command::CreateHashes)),
    ("wrangle", action(Command::Wrangle)),
    ("publish", flagged(Command::Publish, RunFlag::Publishing)),
    ("publishlanguage", flagged(Command::PublishLanguage, RunFlag::Publishing)),
    ("publishlayout", flagged(Command::PublishLayout, RunFlag::Publishing)),
    ("publishlayoutlanguage", flagged(Command::PublishLayoutLanguage, RunFlag::Publishing)),
    ("publishdlc", flagged(Command::PublishDlc, RunFlag::Publishing)),
    ("getcookedbuild", action(Command::GetCookedBuild)),
    ("getcookedlanguage", action(Command::GetCookedLanguage)),
    ("getinstallablebuild", action(Command::GetInstallableBuild)),
    ("buildinstaller", flagged(Command::BuildInstaller, RunFlag::MakingInstall)),
    ("copyinstaller", action(Command::CopyInstaller)),
    ("createdvdlayout", action(Command::CreateDvdLayout)),
    ("conform", action(Command::Conform)),
    ("crossbuildconform", action(Command::CrossBuildConform)),
    ("createcontenttags", action(Command::CreateContentTags)),
    ("updatesourceserver", action(Command::UpdateSourceServer)),
    ("updatesymbolserver", action(Command::UpdateSourceServer)),
    ("blast", action(Command::Blast)),
    ("checksigned", action(Command::CheckSigned)),
    ("sign", action(Command::Sign)),
];

static KEYWORDS: LazyLock<HashMap<&'static str, Entry>> =
    LazyLock::new(|| TABLE.iter().copied().collect());

/// Look up a lowercased keyword.
pub fn lookup(keyword: &str) -> Option<Entry> {
    KEYWORDS.get(keyword).copied()
}

/// All keywords, in table order.
pub fn keywords() -> impl Iterator<Item = &'static str> {
    TABLE.iter().map(|(k, _)| *k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_are_unique_and_lowercase() {
        assert_eq!(KEYWORDS.len(), TABLE.len());
        for keyword in keywords() {
            assert_eq!(keyword, keyword.to_lowercase());
        }
    }

    #[test]
    fn test_lookup() {
        let entry = lookup("publishdlc").unwrap();
        assert_eq!(entry.command, Command::PublishDlc);
        assert_eq!(entry.flag, Some(RunFlag::Publishing));

        let entry = lookup("redflash").unwrap();
        assert_eq!(entry.directive, Some(Directive::SmsAddress));
        assert_eq!(entry.command, Command::RedFlash);

        assert_eq!(lookup("checkoutgame").unwrap().command, Command::Checkout);
        assert!(lookup("frobnicate").is_none());
    }

    #[yare::parameterized(
        ps3makepatch = { "ps3makepatch", Command::MakePatch },
        ps3makepatchbinary = { "ps3makepatchbinary", Command::MakePatchBinary },
        preheatmapoven = { "preheatmapoven", Command::PreHeatMapOven },
        preheatdlc = { "preheatdlc", Command::PreHeatDlc },
        addunrealgamejob = { "addunrealgamejob", Command::AddUnrealGameJob },
        addunrealfullgamejob = { "addunrealfullgamejob", Command::AddUnrealFullGameJob },
        updatesymbolserver = { "updatesymbolserver", Command::UpdateSourceServer },
        updategdfversion = { "updategdfversion", Command::UpdateGdfVersion },
        tagpcs = { "tagpcs", Command::TagFile },
        useps3sdk = { "useps3sdk", Command::Config },
        sourcebuildcopy = { "sourcebuildcopy", Command::SourceBuildCopy },
        checkoutdialog = { "checkoutdialog", Command::CheckoutDialog },
        checkoutfonts = { "checkoutfonts", Command::CheckoutFonts },
        checkoutlocpackage = { "checkoutlocpackage", Command::CheckoutLocPackage },
        checkoutgdf = { "checkoutgdf", Command::CheckoutGdf },
    )]
    fn test_existing_script_keywords(keyword: &str, command: Command) {
        assert_eq!(lookup(keyword).map(|e| e.command), Some(command));
    }

    #[test]
    fn test_every_process_command_is_reachable() {
        for (keyword, entry) in TABLE {
            if entry.command.kind() == buildfarm_core::CommandKind::Process {
                assert!(entry.command.tool_key().is_some(), "{keyword} has no tool");
            }
        }
    }
}
