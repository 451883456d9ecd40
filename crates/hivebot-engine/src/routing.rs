//! Routing resolver — turns raw message text into an execution target.
//!
//! Messages may start with a run of `@name` mentions (`^@<id>(\s+@<id>)*\s+`,
//! ids matching `[a-z][a-z0-9_-]*`). A single matched agent or team routes
//! there with the prefix stripped; several matched targets produce the
//! ambiguity sentinel; no match falls back to the default agent with the text
//! untouched. `@swarm <id>` (or mentioning a swarm id directly) routes into
//! the swarm engine under a synthetic `swarm:<id>` key so long-running jobs
//! never block the worker agent's conversational queue.

use regex::Regex;

use hivebot_core::config::Config;
use hivebot_core::types::QueueMessage;

/// Reply sent when a message mentions more than one agent or team.
pub const AMBIGUOUS_ROUTE_REPLY: &str =
    "🐝 One at a time, please! Mention a single agent or team and I'll get right on it.";

/// Reply sent when no agent is configured at all.
pub const NO_TARGET_REPLY: &str =
    "No agents are configured. Add at least one agent to config.json and restart.";

// ─────────────────────────────────────────────
// Route
// ─────────────────────────────────────────────

/// Resolved execution target for one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Single conversational agent.
    Agent { agent_id: String, payload: String },
    /// Team chain, entering at the leader.
    Team {
        team_id: String,
        leader: String,
        payload: String,
    },
    /// Swarm job.
    Swarm { swarm_id: String, payload: String },
    /// `@swarm` handshake naming a swarm that does not exist.
    UnknownSwarm { swarm_id: String },
    /// More than one agent/team mentioned; answered with the fixed reply.
    Ambiguous,
    /// No agents configured.
    NoTarget,
}

impl Route {
    /// Serialization key for the per-key FIFO. Swarm routes use a synthetic
    /// key so swarm jobs run beside, not ahead of, agent conversations.
    pub fn target_key(&self) -> String {
        match self {
            Route::Agent { agent_id, .. } => agent_id.clone(),
            Route::Team { leader, .. } => leader.clone(),
            Route::Swarm { swarm_id, .. } => format!("swarm:{swarm_id}"),
            Route::UnknownSwarm { .. } | Route::Ambiguous | Route::NoTarget => "system".into(),
        }
    }
}

// ─────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────

/// Resolve a message to its execution target.
pub fn resolve(config: &Config, msg: &QueueMessage) -> Route {
    // A pre-routed agent hint wins when it names a known agent.
    if let Some(hint) = &msg.agent {
        if config.find_agent(hint).is_some() {
            return Route::Agent {
                agent_id: hint.clone(),
                payload: msg.message.clone(),
            };
        }
    }

    let (tokens, remainder) = leading_mentions(&msg.message);

    // `@swarm <id> ...` handshake.
    if tokens.first().map(String::as_str) == Some("swarm") {
        let (swarm_id, payload) = split_first_word(&remainder);
        if swarm_id.is_empty() {
            return Route::UnknownSwarm {
                swarm_id: String::new(),
            };
        }
        return match config.find_swarm(&swarm_id) {
            Some(_) => Route::Swarm {
                swarm_id,
                payload,
            },
            None => Route::UnknownSwarm { swarm_id },
        };
    }

    // Direct swarm id mention.
    if let Some(first) = tokens.first() {
        if config.find_swarm(first).is_some() {
            return Route::Swarm {
                swarm_id: first.clone(),
                payload: remainder,
            };
        }
    }

    // Matched agent/team mentions among the leading run.
    let matched: Vec<&String> = tokens
        .iter()
        .filter(|t| config.find_agent(t).is_some() || config.find_team(t).is_some())
        .collect();

    match matched.len() {
        0 => match config.default_agent() {
            Some(agent) => Route::Agent {
                agent_id: agent.id.clone(),
                payload: msg.message.clone(),
            },
            None => Route::NoTarget,
        },
        1 => {
            let id = matched[0];
            if let Some(team) = config.find_team(id) {
                Route::Team {
                    team_id: team.id.clone(),
                    leader: team.leader_agent.clone(),
                    payload: remainder,
                }
            } else {
                Route::Agent {
                    agent_id: id.to_string(),
                    payload: remainder,
                }
            }
        }
        _ => Route::Ambiguous,
    }
}

/// Split the leading `@token` run off a message.
///
/// A token only counts when the whole whitespace-delimited word matches the
/// id grammar; `@bob:` ends the run and stays in the payload.
fn leading_mentions(message: &str) -> (Vec<String>, String) {
    let word_re = mention_word_regex();
    let mut tokens = Vec::new();
    let mut rest = message.trim_start();

    loop {
        let word_end = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        let word = &rest[..word_end];
        match word_re.captures(word) {
            Some(cap) => {
                tokens.push(cap[1].to_string());
                rest = rest[word_end..].trim_start();
                if rest.is_empty() {
                    break;
                }
            }
            None => break,
        }
    }

    (tokens, rest.to_string())
}

fn split_first_word(text: &str) -> (String, String) {
    let trimmed = text.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(end) => (
            trimmed[..end].to_string(),
            trimmed[end..].trim_start().to_string(),
        ),
        None => (trimmed.to_string(), String::new()),
    }
}

fn mention_word_regex() -> Regex {
    Regex::new(r"^@([a-z][a-z0-9_-]*)$").unwrap()
}

// ─────────────────────────────────────────────
// Teammate mentions (chain handoffs)
// ─────────────────────────────────────────────

/// A teammate mentioned in a worker response, with the text addressed to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeammateMention {
    pub agent_id: String,
    pub body: String,
}

/// Extract teammate mentions from a response body.
///
/// Only ids in `teammates` count. Mentions are returned in order of first
/// occurrence, one entry per teammate; each body runs from the mention to the
/// next teammate mention (or end of response).
pub fn extract_teammate_mentions(response: &str, teammates: &[&str]) -> Vec<TeammateMention> {
    let re = Regex::new(r"@([a-z][a-z0-9_-]*)").unwrap();

    let occurrences: Vec<(usize, usize, String)> = re
        .captures_iter(response)
        .filter_map(|cap| {
            let whole = cap.get(0).unwrap();
            let id = cap[1].to_string();
            teammates
                .contains(&id.as_str())
                .then(|| (whole.start(), whole.end(), id))
        })
        .collect();

    let mut mentions = Vec::new();
    for (i, (_, end, id)) in occurrences.iter().enumerate() {
        if mentions.iter().any(|m: &TeammateMention| &m.agent_id == id) {
            continue;
        }
        let until = occurrences
            .get(i + 1)
            .map(|(start, _, _)| *start)
            .unwrap_or(response.len());
        let body = response[*end..until]
            .trim_start_matches([':', ','])
            .trim()
            .to_string();
        mentions.push(TeammateMention {
            agent_id: id.clone(),
            body,
        });
    }

    mentions
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hivebot_core::config::{AgentSpec, Provider, SwarmSpec, TeamSpec};

    fn test_config() -> Config {
        let mut config = Config {
            agents: vec![
                AgentSpec::new("alice", "Alice", Provider::Anthropic),
                AgentSpec::new("bob", "Bob", Provider::OpenAi),
            ],
            teams: vec![TeamSpec {
                id: "eng".into(),
                name: "Engineering".into(),
                agents: vec!["alice".into(), "bob".into()],
                leader_agent: "alice".into(),
            }],
            swarms: Vec::new(),
            queue: Default::default(),
        };
        config.swarms.push(
            serde_json::from_value(serde_json::json!({
                "id": "scan", "name": "Scan", "agent": "alice",
                "promptTemplate": "scan: {{items}}"
            }))
            .unwrap(),
        );
        config
    }

    fn msg(text: &str) -> QueueMessage {
        QueueMessage::new("test", "user", text, "m1")
    }

    #[test]
    fn test_agent_hint_wins() {
        let config = test_config();
        let mut m = msg("@alice ignored by hint");
        m.agent = Some("bob".into());

        let route = resolve(&config, &m);
        assert_eq!(
            route,
            Route::Agent {
                agent_id: "bob".into(),
                payload: "@alice ignored by hint".into()
            }
        );
    }

    #[test]
    fn test_unknown_hint_falls_through() {
        let config = test_config();
        let mut m = msg("@bob do thing");
        m.agent = Some("ghost".into());

        assert_eq!(
            resolve(&config, &m),
            Route::Agent {
                agent_id: "bob".into(),
                payload: "do thing".into()
            }
        );
    }

    #[test]
    fn test_single_agent_prefix_stripped() {
        let route = resolve(&test_config(), &msg("@bob do thing"));
        assert_eq!(
            route,
            Route::Agent {
                agent_id: "bob".into(),
                payload: "do thing".into()
            }
        );
        assert_eq!(route.target_key(), "bob");
    }

    #[test]
    fn test_team_routes_to_leader() {
        let route = resolve(&test_config(), &msg("@eng start"));
        assert_eq!(
            route,
            Route::Team {
                team_id: "eng".into(),
                leader: "alice".into(),
                payload: "start".into()
            }
        );
        assert_eq!(route.target_key(), "alice");
    }

    #[test]
    fn test_unrouted_goes_to_default_with_text_untouched() {
        let route = resolve(&test_config(), &msg("hello there"));
        assert_eq!(
            route,
            Route::Agent {
                agent_id: "alice".into(),
                payload: "hello there".into()
            }
        );
    }

    #[test]
    fn test_unmatched_mention_goes_to_default_untouched() {
        let route = resolve(&test_config(), &msg("@ghost hello"));
        assert_eq!(
            route,
            Route::Agent {
                agent_id: "alice".into(),
                payload: "@ghost hello".into()
            }
        );
    }

    #[test]
    fn test_multiple_mentions_are_ambiguous() {
        assert_eq!(
            resolve(&test_config(), &msg("@alice @bob both of you")),
            Route::Ambiguous
        );
        assert_eq!(
            resolve(&test_config(), &msg("@alice @eng hi")),
            Route::Ambiguous
        );
    }

    #[test]
    fn test_mid_message_mentions_do_not_route() {
        let route = resolve(&test_config(), &msg("please ask @bob about it"));
        assert_eq!(
            route,
            Route::Agent {
                agent_id: "alice".into(),
                payload: "please ask @bob about it".into()
            }
        );
    }

    #[test]
    fn test_swarm_handshake() {
        let route = resolve(&test_config(), &msg("@swarm scan [1,2,3]"));
        assert_eq!(
            route,
            Route::Swarm {
                swarm_id: "scan".into(),
                payload: "[1,2,3]".into()
            }
        );
        assert_eq!(route.target_key(), "swarm:scan");
    }

    #[test]
    fn test_direct_swarm_id_mention() {
        let route = resolve(&test_config(), &msg("@scan the repos"));
        assert_eq!(
            route,
            Route::Swarm {
                swarm_id: "scan".into(),
                payload: "the repos".into()
            }
        );
    }

    #[test]
    fn test_unknown_swarm_handshake() {
        assert_eq!(
            resolve(&test_config(), &msg("@swarm nosuch run it")),
            Route::UnknownSwarm {
                swarm_id: "nosuch".into()
            }
        );
    }

    #[test]
    fn test_no_agents_configured() {
        let config = Config {
            agents: Vec::new(),
            teams: Vec::new(),
            swarms: Vec::new(),
            queue: Default::default(),
        };
        assert_eq!(resolve(&config, &msg("hello")), Route::NoTarget);
    }

    #[test]
    fn test_leading_mentions_stop_at_invalid_word() {
        let (tokens, rest) = leading_mentions("@bob: hi there");
        assert!(tokens.is_empty());
        assert_eq!(rest, "@bob: hi there");

        let (tokens, rest) = leading_mentions("@bob hi @alice");
        assert_eq!(tokens, vec!["bob"]);
        assert_eq!(rest, "hi @alice");
    }

    #[test]
    fn test_leading_mention_without_payload() {
        let (tokens, rest) = leading_mentions("@bob");
        assert_eq!(tokens, vec!["bob"]);
        assert_eq!(rest, "");
    }

    // ── Teammate mentions ──

    #[test]
    fn test_extract_single_mention_with_body() {
        let mentions =
            extract_teammate_mentions("Looks good. @bob please continue with the tests", &["bob"]);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].agent_id, "bob");
        assert_eq!(mentions[0].body, "please continue with the tests");
    }

    #[test]
    fn test_extract_multiple_mentions_bodies_bounded() {
        let response = "Splitting this up.\n@bob handle the backend\n@carol handle the docs";
        let mentions = extract_teammate_mentions(response, &["bob", "carol"]);
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].agent_id, "bob");
        assert_eq!(mentions[0].body, "handle the backend");
        assert_eq!(mentions[1].agent_id, "carol");
        assert_eq!(mentions[1].body, "handle the docs");
    }

    #[test]
    fn test_extract_ignores_non_teammates() {
        let mentions = extract_teammate_mentions("@stranger hi @bob go", &["bob"]);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].agent_id, "bob");
    }

    #[test]
    fn test_extract_dedupes_keeping_first() {
        let response = "@bob first ask\nmore text @bob second ask";
        let mentions = extract_teammate_mentions(response, &["bob"]);
        assert_eq!(mentions.len(), 1);
        // Body runs to the next mention occurrence, duplicate or not
        assert_eq!(mentions[0].body, "first ask\nmore text");
    }

    #[test]
    fn test_extract_strips_colon_after_mention() {
        let mentions = extract_teammate_mentions("@bob: check the logs", &["bob"]);
        assert_eq!(mentions[0].body, "check the logs");
    }

    #[test]
    fn test_extract_no_mentions() {
        assert!(extract_teammate_mentions("all done here", &["bob"]).is_empty());
    }
}
