//! Resource policies and the route registry.
//!
//! Declared policies are compiled once at startup into an ordered list of
//! anchored, case-insensitive patterns. Matching is first-declared-wins, never
//! most-specific-wins: a broad `.*` policy declared first shadows everything
//! after it, exactly as the operator wrote it.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::clients::{ClientConfiguration, ClientDirectory};
use crate::token::RoleRequirement;
use crate::{Error, Result};

/// A declarative resource policy entry, as loaded from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Regular expression matched against the request path. Anchored with
    /// `^`/`$` automatically if not already.
    #[serde(rename = "match")]
    pub match_pattern: String,
    /// HTTP methods this policy applies to. Absent = all methods.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Rewrite template for the upstream path; may reference capture groups
    /// (`$1`, `$2`, ...).
    #[serde(default, rename = "override")]
    pub override_path: Option<String>,
    /// Public resources skip authentication entirely.
    #[serde(default)]
    pub public: bool,
    /// Role requirement for authenticated access.
    #[serde(default)]
    pub roles: Option<RoleRequirement>,
    /// Redirect unauthenticated browser traffic into the interactive login
    /// flow instead of answering 401.
    #[serde(default)]
    pub sso_flow: bool,
    /// Symbolic client id, either a literal or `$N` referencing a capture
    /// group of `match`.
    #[serde(default)]
    pub client_sid: Option<String>,
}

/// A compiled resource policy.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    pattern: Regex,
    methods: Option<Vec<String>>,
    override_path: Option<String>,
    /// Skip authentication for matching requests.
    pub public: bool,
    /// Role requirement, if any.
    pub roles: Option<RoleRequirement>,
    /// Interactive login redirect enabled.
    pub sso_flow: bool,
    client_sid: Option<String>,
    /// Original pattern source, for error messages.
    source: String,
}

/// A policy match for one concrete request: the (possibly rewritten) target
/// path plus the policy fields and the resolved provider client.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    /// Upstream path — the request path after `override` rewriting.
    pub path: String,
    /// Whether the resource is public.
    pub public: bool,
    /// Role requirement for the resource.
    pub roles: Option<RoleRequirement>,
    /// Whether unauthenticated browsers are sent into the SSO flow.
    pub sso_flow: bool,
    /// Symbolic id after `$N` substitution, if the policy declared one.
    pub client_sid: Option<String>,
    /// Provider client resolved from `client_sid`.
    pub client: Option<ClientConfiguration>,
}

/// Ordered, immutable-after-load route policy matcher.
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    policies: Vec<ResourcePolicy>,
}

impl ResourceRegistry {
    /// Compile declared policies, validating everything that can be validated
    /// before traffic arrives: pattern syntax, `sso_flow`/`client_sid`
    /// coupling, and literal `client_sid` resolution. Only `$N` capture sids
    /// must wait for a concrete request.
    pub fn compile(configs: &[ResourceConfig], directory: &ClientDirectory) -> Result<Self> {
        let mut policies = Vec::with_capacity(configs.len());

        for config in configs {
            if config.sso_flow && config.client_sid.is_none() {
                return Err(Error::Config(format!(
                    "\"client_sid\" is missing in resource definition \"{}\" with sso_flow enabled",
                    config.match_pattern
                )));
            }

            if let Some(sid) = &config.client_sid {
                if !sid.starts_with('$') {
                    directory.by_sid(sid).map_err(|_| {
                        Error::Config(format!(
                            "resource \"{}\" references unknown client_sid \"{sid}\"",
                            config.match_pattern
                        ))
                    })?;
                }
            }

            let mut source = config.match_pattern.clone();
            if !source.starts_with('^') {
                source.insert(0, '^');
            }
            if !source.ends_with('$') {
                source.push('$');
            }

            let pattern = RegexBuilder::new(&source)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    Error::Config(format!("invalid pattern \"{}\": {e}", config.match_pattern))
                })?;

            policies.push(ResourcePolicy {
                pattern,
                methods: config
                    .methods
                    .as_ref()
                    .map(|m| m.iter().map(|v| v.to_uppercase()).collect()),
                override_path: config.override_path.clone(),
                public: config.public,
                roles: config.roles.clone(),
                sso_flow: config.sso_flow,
                client_sid: config.client_sid.clone(),
                source: config.match_pattern.clone(),
            });
        }

        Ok(Self { policies })
    }

    /// Find the first policy matching `path` and `method`, in declaration
    /// order. Returns `Ok(None)` when no policy matches.
    ///
    /// # Errors
    ///
    /// A `$N` capture sid that references a missing group or resolves to no
    /// configured client is a configuration error for this request.
    pub fn resolve(
        &self,
        path: &str,
        method: &str,
        directory: &ClientDirectory,
    ) -> Result<Option<ResolvedResource>> {
        let method = method.to_uppercase();

        for policy in &self.policies {
            if let Some(methods) = &policy.methods {
                if !methods.iter().any(|m| *m == method) {
                    continue;
                }
            }

            let Some(captures) = policy.pattern.captures(path) else {
                continue;
            };

            let client_sid = match &policy.client_sid {
                Some(sid) if sid.starts_with('$') => {
                    let group: usize = sid[1..].parse().map_err(|_| {
                        Error::Config(format!(
                            "resource \"{}\" has malformed capture reference \"{sid}\"",
                            policy.source
                        ))
                    })?;
                    let captured = captures.get(group).ok_or_else(|| {
                        Error::Config(format!(
                            "resource \"{}\" capture group {group} did not match",
                            policy.source
                        ))
                    })?;
                    Some(captured.as_str().to_string())
                }
                other => other.clone(),
            };

            let client = match &client_sid {
                Some(sid) => Some(
                    directory
                        .by_sid(sid)
                        .map_err(|_| {
                            Error::Config(format!(
                                "no client configuration for client_sid \"{sid}\" (resource \"{}\")",
                                policy.source
                            ))
                        })?
                        .clone(),
                ),
                None => None,
            };

            let target = match &policy.override_path {
                Some(template) => policy.pattern.replace(path, template.as_str()).into_owned(),
                None => path.to_string(),
            };

            debug!(path = %path, target = %target, pattern = %policy.source, "Resource matched");

            return Ok(Some(ResolvedResource {
                path: target,
                public: policy.public,
                roles: policy.roles.clone(),
                sso_flow: policy.sso_flow,
                client_sid,
                client,
            }));
        }

        debug!(path = %path, method = %method, "No resource matched");
        Ok(None)
    }
}
