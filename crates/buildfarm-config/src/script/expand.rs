//! Placeholder expansion for script lines.
//!
//! Two kinds of substitution are applied, in order:
//! - `%DatabaseParameter%`, `%DatabaseConfig%`, `%Language%` from the build request
//! - `%JobParameter%`, `%JobGame%`, `%JobPlatform%` from the sub-job
//! - `#Name` tokens from the branch's variable table
//!
//! Unknown `%...%` tokens are left untouched. Unknown `#Name` variables
//! expand to nothing.

use buildfarm_core::{BuildRequest, SubJob};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%([A-Za-z]+)%").unwrap());

/// Values available to `%Token%` and `#Name` substitution for one run.
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    pub database_parameter: String,
    pub database_config: String,
    pub language: String,
    pub job_parameter: String,
    pub job_game: String,
    pub job_platform: String,
    pub variables: HashMap<String, String>,
}

impl ExpansionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_request(request: &BuildRequest, variables: HashMap<String, String>) -> Self {
        Self {
            database_parameter: request.parameter.clone().unwrap_or_default(),
            database_config: request.config.clone().unwrap_or_default(),
            language: request.language.clone().unwrap_or_default(),
            variables,
            ..Self::default()
        }
    }

    pub fn for_job(job: &SubJob, variables: HashMap<String, String>) -> Self {
        Self {
            job_parameter: job.parameter.clone(),
            job_game: job.game.clone(),
            job_platform: job.platform.clone(),
            variables,
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    fn resolve_token(&self, token: &str) -> Option<&str> {
        let value = match token {
            "DatabaseParameter" => &self.database_parameter,
            "DatabaseConfig" => &self.database_config,
            "Language" => &self.language,
            "JobParameter" => &self.job_parameter,
            "JobGame" => &self.job_game,
            "JobPlatform" => &self.job_platform,
            _ => return None,
        };
        Some(value)
    }

    /// Expand a script command line.
    pub fn expand(&self, input: &str) -> String {
        let replaced = TOKEN_REGEX.replace_all(input, |caps: &regex::Captures| {
            self.resolve_token(&caps[1])
                .map(|v| v.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        });

        let mut line = String::new();
        for token in replaced.split([' ', '\t']) {
            match token.strip_prefix('#') {
                Some(name) => line.push_str(self.variables.get(name).map(String::as_str).unwrap_or("")),
                None => line.push_str(token),
            }
            line.push(' ');
        }
        line.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExpansionContext {
        ExpansionContext {
            database_parameter: "Maps.txt".into(),
            database_config: "Shipping".into(),
            language: "DEU".into(),
            ..ExpansionContext::default()
        }
        .with_variable("LatestBuild", "Main_[2024-03-01_17.45]")
    }

    #[test]
    fn test_database_tokens() {
        assert_eq!(ctx().expand("-cfg=%DatabaseConfig% %DatabaseParameter%"), "-cfg=Shipping Maps.txt");
        assert_eq!(ctx().expand("%Language%"), "DEU");
    }

    #[test]
    fn test_unknown_token_preserved() {
        assert_eq!(ctx().expand("%Nope% stays"), "%Nope% stays");
    }

    #[test]
    fn test_variables() {
        assert_eq!(ctx().expand("#LatestBuild"), "Main_[2024-03-01_17.45]");
        assert_eq!(ctx().expand("tag #Missing now"), "tag  now");
    }

    #[test]
    fn test_tabs_become_spaces_and_result_is_trimmed() {
        assert_eq!(ctx().expand("\ta\tb  "), "a b");
    }

    #[test]
    fn test_job_tokens() {
        let mut job_ctx = ExpansionContext::new();
        job_ctx.job_game = "Example".into();
        job_ctx.job_platform = "Xenon".into();
        assert_eq!(job_ctx.expand("%JobGame%_%JobPlatform%"), "Example_Xenon");
    }
}
