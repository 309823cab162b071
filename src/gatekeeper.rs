// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Request-level authorization. Ported from `ev::auth::route::Gatekeeper`
//! (`gatekeeper.cc`/`.h`): an ordered list of regex rules, each restricted
//! to a method set and gated by a role bitmask, evaluated first-match-wins
//! against an incoming request's path. A matching rule that names a job
//! deflects the request to a beanstalkd tube instead of letting it run
//! inline — the original's "bribe" path for moving slow work off the
//! request thread.

use regex::Regex;

use crate::config::GatekeeperConfig;
use crate::errors::CreationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// The request should be queued to the named tube instead of executed.
    Deflected { tube: String },
    Denied,
}

struct Rule {
    regex: Regex,
    methods: Vec<String>,
    role_mask: u64,
    job: Option<String>,
}

impl Rule {
    fn matches(&self, method: &str, path: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }
        self.regex.is_match(path)
    }

    fn role_allowed(&self, role_mask: u64) -> bool {
        self.role_mask == 0 || (role_mask & self.role_mask) != 0
    }
}

/// Compiled rule set. Built once at startup (or re-`load`ed when
/// `bootstrap` wires a config-reload signal) from [`GatekeeperConfig`].
pub struct Gatekeeper {
    rules: Vec<Rule>,
}

impl Gatekeeper {
    pub fn load(config: &GatekeeperConfig) -> Result<Self, CreationError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for (idx, rule) in config.rules.iter().enumerate() {
            let regex = Regex::new(&rule.pattern).map_err(|e| CreationError::InvalidValue {
                field: "gatekeeper.rules[].pattern",
                reason: format!("rule {idx}: {e}"),
            })?;
            rules.push(Rule {
                regex,
                methods: rule.methods.clone(),
                role_mask: rule.role_mask,
                job: rule.job.as_ref().map(|j| j.tube.clone()),
            });
        }
        Ok(Gatekeeper { rules })
    }

    /// Evaluates `method`/`path` against the rule set under `role_mask`.
    /// First matching rule wins; no match at all is `Denied` rather than
    /// defaulting open, matching the original's deny-by-default posture.
    pub fn authorize(&self, method: &str, path: &str, role_mask: u64) -> Decision {
        for rule in &self.rules {
            if !rule.matches(method, path) {
                continue;
            }
            if !rule.role_allowed(role_mask) {
                return Decision::Denied;
            }
            return match &rule.job {
                Some(tube) => Decision::Deflected { tube: tube.clone() },
                None => Decision::Allowed,
            };
        }
        Decision::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatekeeperJob, GatekeeperRule};

    fn config(rules: Vec<GatekeeperRule>) -> GatekeeperConfig {
        GatekeeperConfig { rules }
    }

    #[test]
    fn allows_matching_rule_with_no_role_requirement() {
        let gk = Gatekeeper::load(&config(vec![GatekeeperRule {
            pattern: "^/widgets/".to_string(),
            methods: vec!["GET".to_string()],
            role_mask: 0,
            job: None,
        }]))
        .unwrap();
        assert_eq!(gk.authorize("GET", "/widgets/42", 0), Decision::Allowed);
    }

    #[test]
    fn denies_when_role_mask_does_not_intersect() {
        let gk = Gatekeeper::load(&config(vec![GatekeeperRule {
            pattern: "^/admin/".to_string(),
            methods: vec![],
            role_mask: 0b0010,
            job: None,
        }]))
        .unwrap();
        assert_eq!(gk.authorize("GET", "/admin/panel", 0b0001), Decision::Denied);
        assert_eq!(gk.authorize("GET", "/admin/panel", 0b0010), Decision::Allowed);
    }

    #[test]
    fn deflects_to_job_tube() {
        let gk = Gatekeeper::load(&config(vec![GatekeeperRule {
            pattern: "^/reports/".to_string(),
            methods: vec![],
            role_mask: 0,
            job: Some(GatekeeperJob { tube: "reports".to_string() }),
        }]))
        .unwrap();
        assert_eq!(gk.authorize("POST", "/reports/generate", 0), Decision::Deflected { tube: "reports".to_string() });
    }

    #[test]
    fn denies_unmatched_path_by_default() {
        let gk = Gatekeeper::load(&config(vec![])).unwrap();
        assert_eq!(gk.authorize("GET", "/anything", 0), Decision::Denied);
    }

    #[test]
    fn rejects_invalid_regex_at_load_time() {
        let result = Gatekeeper::load(&config(vec![GatekeeperRule {
            pattern: "(unclosed".to_string(),
            methods: vec![],
            role_mask: 0,
            job: None,
        }]));
        assert!(result.is_err());
    }
}
