//! External tool catalogue.
//!
//! Each process-launching command is rendered from a [`ToolSpec`]: a program,
//! an argument template and the number of script parameters it accepts.
//! Templates use `{name}` placeholders filled from the script state, `{0}`,
//! `{1}`... for individual script parameters and `{args}` for all of them.
//! Placeholders with no value are left as written.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::script::extract_parameters;
use crate::{ConfigError, ConfigResult};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z0-9_]+(?::[a-z0-9_]+)?)\}").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub program: String,
    pub args: String,
    /// Working directory relative to the branch workspace.
    pub cwd: Option<String>,
    pub min_args: usize,
    pub max_args: Option<usize>,
    /// Directory renamed into place for the duration of the command.
    pub override_dir: Option<String>,
}

impl ToolSpec {
    pub fn new(program: &str, args: &str) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_string(),
            cwd: None,
            min_args: 0,
            max_args: None,
            override_dir: None,
        }
    }

    fn cwd(mut self, cwd: &str) -> Self {
        self.cwd = Some(cwd.to_string());
        self
    }

    fn arity(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_args = min;
        self.max_args = max;
        self
    }

    fn with_override(mut self, dir: &str) -> Self {
        self.override_dir = Some(dir.to_string());
        self
    }

    pub fn usage(&self, key: &str) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => format!("Usage: {key} takes exactly {max} parameter(s)"),
            Some(max) => format!("Usage: {key} takes {} to {max} parameters", self.min_args),
            None => format!("Usage: {key} takes at least {} parameter(s)", self.min_args),
        }
    }

    /// Render the invocation for `params` against placeholder `values`.
    pub fn render(&self, key: &str, params: &[String], values: &HashMap<String, String>) -> ConfigResult<Invocation> {
        let too_many = self.max_args.is_some_and(|max| params.len() > max);
        if params.len() < self.min_args || too_many {
            return Err(ConfigError::InvalidValue {
                field: key.to_string(),
                message: self.usage(key),
            });
        }

        Ok(Invocation {
            program: render_template(&self.program, params, values),
            args: extract_parameters(&render_template(&self.args, params, values)),
            cwd: self.cwd.as_ref().map(|c| render_template(c, params, values)),
        })
    }
}

/// A rendered tool command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

fn quote(param: &str) -> String {
    if param.contains(' ') {
        format!("\"{param}\"")
    } else {
        param.to_string()
    }
}

pub fn render_template(template: &str, params: &[String], values: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            if name == "args" {
                return params.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ");
            }
            if let Ok(index) = name.parse::<usize>() {
                return params.get(index).map(|p| quote(p)).unwrap_or_default();
            }
            values
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Tool specs keyed by command keyword.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn get(&self, key: &str) -> Option<&ToolSpec> {
        self.tools.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, spec: ToolSpec) {
        self.tools.insert(key.into(), spec);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        let game = "Binaries/{game}Game";
        let cooker_sync = "Binaries/CookerSync";
        let tools = [
            (
                "msbuild",
                ToolSpec::new("{app:msbuild}", "{0} /verbosity:normal /target:Rebuild \"/property:Configuration={config}\"")
                    .cwd("Development/Src")
                    .arity(1, Some(1)),
            ),
            (
                "unrealbuild",
                ToolSpec::new(
                    "Development/Intermediate/UnrealBuildTool/Release/UnrealBuildTool",
                    "{game} {platform} {config} {defines} {unity} {args}",
                )
                .cwd("Development/Src"),
            ),
            (
                "msvcclean",
                ToolSpec::new("{app:msvc}", "{0}.sln /clean \"{config}\"").arity(1, Some(1)),
            ),
            (
                "msvcbuild",
                ToolSpec::new("{app:msvc}", "{0}.sln /build \"{config}\"").arity(1, Some(1)),
            ),
            (
                "gccclean",
                ToolSpec::new("{app:make}", "-C {0} BUILDTYPE={config} clean").arity(1, Some(1)),
            ),
            (
                "gccbuild",
                ToolSpec::new("{app:make}", "-C {0} BUILDTYPE={config} {defines}").arity(1, Some(1)),
            ),
            (
                "shaderbuild",
                ToolSpec::new(game, "PrecompileShaders Platform={platform} {args} {common}").cwd("Binaries"),
            ),
            (
                "shaderbuildstate",
                ToolSpec::new(game, "PrecompileShaders Platform={platform} -BuildState {args} {common}").cwd("Binaries"),
            ),
            (
                "makepatch",
                ToolSpec::new("make_package_npdrm", "--patch {0} {1}")
                    .cwd("{game}Game/Build/{platform}/Patch")
                    .arity(2, Some(2))
                    .with_override("Development/External/MinGW"),
            ),
            ("makepatchbinary", ToolSpec::new("make_fself_npdrm", "{0} {1}").arity(2, Some(2))),
            (
                "buildscript",
                ToolSpec::new(game, "make {scriptconfig} {args} {common}").cwd("Binaries"),
            ),
            (
                "cookmaps",
                ToolSpec::new(
                    game,
                    "CookPackages -Platform={platform} {args} -alwaysRecookmaps -alwaysRecookScript {common} -LanguageForCooking={language} {cookconfig}",
                )
                .cwd("Binaries"),
            ),
            (
                "cooksounds",
                ToolSpec::new(game, "ResavePackages -ResaveClass=SoundNodeWave -ForceSoundRecook {args} {common}")
                    .cwd("Binaries"),
            ),
            (
                "createhashes",
                ToolSpec::new(game, "CreateHashes -Platform={platform} {common}").cwd("Binaries"),
            ),
            ("wrangle", ToolSpec::new(game, "WrangleContent {args} {common}").cwd("Binaries")),
            (
                "publish",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x CompleteBuild -r {language} -b {branch} -crc -v {force} {destinations}")
                    .arity(1, None),
            ),
            (
                "publishlanguage",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x Loc -r {language} -b {branch} -crc -v {force} {destinations}")
                    .arity(1, None),
            ),
            (
                "publishlayout",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x Layout -r {language} -b {branch} -crc -v {force} {destinations}")
                    .arity(1, None),
            ),
            (
                "publishlayoutlanguage",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x LayoutLoc -r {language} -b {branch} -crc -v {force} {destinations}")
                    .arity(1, None),
            ),
            (
                "publishdlc",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x DLC -r {language} -b {branch} -crc -v {force} {destinations}")
                    .arity(1, None),
            ),
            (
                "getcookedbuild",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x CompleteBuild -crc -v -base {args} .").arity(1, None),
            ),
            (
                "getcookedlanguage",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x Loc -r {language} -crc -v -base {args} .").arity(1, None),
            ),
            (
                "getinstallablebuild",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x Installable -crc -v -base {args} .").arity(1, None),
            ),
            (
                "buildinstaller",
                ToolSpec::new("{app:isdev}", "-p {0} -r {installconfig} -c {compression}").arity(1, Some(1)),
            ),
            (
                "copyinstaller",
                ToolSpec::new(cooker_sync, "{game} -p {platform} -x Installer -crc -v {destinations}").arity(1, None),
            ),
            (
                "createdvdlayout",
                ToolSpec::new(game, "CreateDVDLayout -Platform={platform} {args} {common}").cwd("Binaries"),
            ),
            (
                "conform",
                ToolSpec::new(game, "conform {0}_{language} {0}_{conformsource} {common}")
                    .cwd("Binaries")
                    .arity(1, Some(1)),
            ),
            (
                "crossbuildconform",
                ToolSpec::new(game, "conform {0} {1} {common}").cwd("Binaries").arity(2, Some(2)),
            ),
            (
                "createcontenttags",
                ToolSpec::new(game, "CreateContentTags {common}").cwd("Binaries"),
            ),
            ("updatesourceserver", ToolSpec::new("{app:sourceserver}", "{args}")),
            ("symstore", ToolSpec::new("{app:symstore}", "{args}")),
            ("blast", ToolSpec::new("Binaries/{platform}/Blast", "{args}")),
            (
                "checksigned",
                ToolSpec::new("{app:signtool}", "verify /pa /v {0}").arity(1, Some(1)),
            ),
            ("sign", ToolSpec::new("{app:signtool}", "sign /a /v {0}").arity(1, Some(1))),
        ];

        Self {
            tools: tools.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_core::Command;

    fn values() -> HashMap<String, String> {
        HashMap::from([
            ("game".to_string(), "Example".to_string()),
            ("platform".to_string(), "PC".to_string()),
            ("config".to_string(), "Release".to_string()),
            ("language".to_string(), "INT".to_string()),
            ("cookconfig".to_string(), String::new()),
            ("common".to_string(), "-unattended".to_string()),
            ("app:msvc".to_string(), "/opt/msvc/devenv".to_string()),
        ])
    }

    #[test]
    fn test_render_msvc_build() {
        let catalog = ToolCatalog::default();
        let spec = catalog.get("msvcbuild").unwrap();
        let invocation = spec.render("msvcbuild", &["Game".to_string()], &values()).unwrap();
        assert_eq!(invocation.program, "/opt/msvc/devenv");
        assert_eq!(invocation.args, vec!["Game.sln", "/build", "Release"]);
    }

    #[test]
    fn test_render_drops_empty_placeholders() {
        let catalog = ToolCatalog::default();
        let spec = catalog.get("cookmaps").unwrap();
        let params = vec!["Entry".to_string(), "Level 1".to_string()];
        let invocation = spec.render("cookmaps", &params, &values()).unwrap();
        assert_eq!(invocation.program, "Binaries/ExampleGame");
        assert_eq!(
            invocation.args,
            vec![
                "CookPackages",
                "-Platform=PC",
                "Entry",
                "Level 1",
                "-alwaysRecookmaps",
                "-alwaysRecookScript",
                "-unattended",
                "-LanguageForCooking=INT",
            ]
        );
        assert_eq!(invocation.cwd.as_deref(), Some("Binaries"));
    }

    #[test]
    fn test_arity_is_checked() {
        let catalog = ToolCatalog::default();
        let spec = catalog.get("checksigned").unwrap();
        let err = spec.render("checksigned", &[], &values()).unwrap_err();
        assert!(err.to_string().contains("takes exactly 1 parameter"));

        let spec = catalog.get("publish").unwrap();
        assert!(spec.render("publish", &[], &values()).is_err());
    }

    #[test]
    fn test_unknown_placeholder_is_kept() {
        let rendered = render_template("{mystery} {1}", &["a".to_string()], &values());
        assert_eq!(rendered, "{mystery} ");
    }

    #[test]
    fn test_every_tool_command_has_a_default() {
        use crate::script::keywords;
        let catalog = ToolCatalog::default();
        for keyword in keywords::keywords() {
            let entry = keywords::lookup(keyword).unwrap();
            if let Some(key) = entry.command.tool_key() {
                assert!(catalog.get(key).is_some(), "no tool for {key}");
            }
        }
        assert!(catalog.get(Command::Sign.tool_key().unwrap()).is_some());
        assert!(catalog.get(Command::UpdateSymbolServerTick.tool_key().unwrap()).is_some());
    }

    #[test]
    fn test_render_patch_runs_in_patch_folder() {
        let catalog = ToolCatalog::default();
        let spec = catalog.get("makepatch").unwrap();
        let params = vec!["Patch.conf".to_string(), "Patch.pkg".to_string()];
        let invocation = spec.render("makepatch", &params, &values()).unwrap();
        assert_eq!(invocation.program, "make_package_npdrm");
        assert_eq!(invocation.args, vec!["--patch", "Patch.conf", "Patch.pkg"]);
        assert_eq!(invocation.cwd.as_deref(), Some("ExampleGame/Build/PC/Patch"));
        assert!(spec.render("makepatch", &params[..1], &values()).is_err());
    }
}
