//! Abstract commands, execution modes and run failures.
//!
//! A build script is interpreted into a sequence of [`Command`]s. The state
//! machine moves between [`Mode`]s while executing them, and a failed command
//! leaves a [`Failure`] behind for the Finalise step to report.

use derive_more::Display;

/// Every action or pseudo-action a script line can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Command {
    // Pseudo-commands handled by the state machine itself.
    Error,
    Config,
    Finished,
    TriggerMail,
    Wait,
    WaitForJobs,
    SetDependency,
    RedFlash,
    Trigger,
    UpdateLabel,
    UpdateFolder,
    CheckSpace,
    MsvcFull,
    GccFull,
    ShaderFull,
    UpdateSymbolServer,

    // Source control.
    Sync,
    ArtistSync,
    GetChanges,
    SyncSingleChangeList,
    Checkout,
    CheckoutDialog,
    CheckoutFonts,
    CheckoutLocPackage,
    CheckoutGdf,
    OpenForDelete,
    MakeWritable,
    Submit,
    CreateNewLabel,
    UpdateLabelDescription,
    Revert,
    RevertFile,
    Tag,
    TagFile,
    CheckConsistency,

    // Local filesystem.
    Clean,
    Cleanup,
    ShaderClean,
    SimpleCopy,
    SimpleDelete,
    SimpleRename,
    RenamedCopy,
    BumpEngineVersion,
    GetEngineVersion,
    SourceBuildCopy,
    PreHeatMapOven,
    PreHeatDlc,
    UpdateGdfVersion,

    // Sub-jobs.
    AddJob,
    AddUnrealGameJob,
    AddUnrealFullGameJob,

    // External tools.
    MsBuild,
    UnrealBuild,
    MsvcClean,
    MsvcBuild,
    GccClean,
    GccBuild,
    ShaderBuild,
    ShaderBuildState,
    MakePatch,
    MakePatchBinary,
    BuildScript,
    CookMaps,
    CookSounds,
    CreateHashes,
    Wrangle,
    Publish,
    PublishLanguage,
    PublishLayout,
    PublishLayoutLanguage,
    PublishDlc,
    GetCookedBuild,
    GetCookedLanguage,
    GetInstallableBuild,
    BuildInstaller,
    CopyInstaller,
    CreateDvdLayout,
    Conform,
    CrossBuildConform,
    CreateContentTags,
    UpdateSourceServer,
    UpdateSymbolServerTick,
    Blast,
    CheckSigned,
    Sign,
}

/// Which collaborator executes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Pseudo,
    SourceControl,
    FileSystem,
    Jobs,
    Process,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        use Command::*;
        match self {
            Error | Config | Finished | TriggerMail | Wait | WaitForJobs | SetDependency
            | RedFlash | Trigger | UpdateLabel | UpdateFolder | CheckSpace | MsvcFull | GccFull
            | ShaderFull | UpdateSymbolServer => CommandKind::Pseudo,
            Sync | ArtistSync | GetChanges | SyncSingleChangeList | Checkout | CheckoutDialog
            | CheckoutFonts | CheckoutLocPackage | CheckoutGdf | OpenForDelete | MakeWritable
            | Submit | CreateNewLabel | UpdateLabelDescription | Revert | RevertFile | Tag
            | TagFile | CheckConsistency => CommandKind::SourceControl,
            Clean | Cleanup | ShaderClean | SimpleCopy | SimpleDelete | SimpleRename
            | RenamedCopy | BumpEngineVersion | GetEngineVersion | SourceBuildCopy
            | PreHeatMapOven | PreHeatDlc | UpdateGdfVersion => CommandKind::FileSystem,
            AddJob | AddUnrealGameJob | AddUnrealFullGameJob => CommandKind::Jobs,
            _ => CommandKind::Process,
        }
    }

    pub fn is_source_control(&self) -> bool {
        self.kind() == CommandKind::SourceControl
    }

    /// Publishing steps compete for the farm-wide bandwidth conch.
    pub fn is_publish(&self) -> bool {
        matches!(
            self,
            Command::Publish
                | Command::PublishLanguage
                | Command::PublishLayout
                | Command::PublishLayoutLanguage
                | Command::PublishDlc
        )
    }

    /// Key into the tool catalogue for commands that launch a process.
    pub fn tool_key(&self) -> Option<&'static str> {
        use Command::*;
        let key = match self {
            MsBuild => "msbuild",
            UnrealBuild => "unrealbuild",
            MsvcClean => "msvcclean",
            MsvcBuild => "msvcbuild",
            GccClean => "gccclean",
            GccBuild => "gccbuild",
            ShaderBuild => "shaderbuild",
            ShaderBuildState => "shaderbuildstate",
            MakePatch => "makepatch",
            MakePatchBinary => "makepatchbinary",
            BuildScript => "buildscript",
            CookMaps => "cookmaps",
            CookSounds => "cooksounds",
            CreateHashes => "createhashes",
            Wrangle => "wrangle",
            Publish => "publish",
            PublishLanguage => "publishlanguage",
            PublishLayout => "publishlayout",
            PublishLayoutLanguage => "publishlayoutlanguage",
            PublishDlc => "publishdlc",
            GetCookedBuild => "getcookedbuild",
            GetCookedLanguage => "getcookedlanguage",
            GetInstallableBuild => "getinstallablebuild",
            BuildInstaller => "buildinstaller",
            CopyInstaller => "copyinstaller",
            CreateDvdLayout => "createdvdlayout",
            Conform => "conform",
            CrossBuildConform => "crossbuildconform",
            CreateContentTags => "createcontenttags",
            UpdateSourceServer => "updatesourceserver",
            UpdateSymbolServerTick => "symstore",
            Blast => "blast",
            CheckSigned => "checksigned",
            Sign => "sign",
            _ => return None,
        };
        Some(key)
    }
}

/// Execution mode of one build state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Mode {
    Init,
    Monitor,
    Wait,
    WaitForJobs,
    Finalise,
    Exit,
}

/// Why a run (or the current command of a run) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Failure {
    NoScript,
    IllegalCommand,
    Process,
    TimedOut,
    WaitTimedOut,
    FailedJobs,
    Crashed,
    /// A specific action failed, including a cook or publish that never
    /// reported its success marker.
    #[display("{_0}")]
    Command(Command),
}

impl Failure {
    pub fn is_source_control(&self) -> bool {
        matches!(self, Failure::Command(c) if c.is_source_control())
    }
}
