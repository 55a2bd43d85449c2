//! Two providers discuss a task in alternating turns until both emit the consensus
//! marker or the round limit runs out, then the higher-ranked one writes the final answer.

use std::sync::Arc;

use crate::{build_provider, ChatMessage, FileConfig, LlmProvider};

pub(crate) const CONSENSUS_MARKER: &str = "[AGREED]";
pub(crate) const MAX_ROUNDS: usize = 5;

struct ProviderProfile {
    key: &'static str,
    name: &'static str,
    emoji: &'static str,
    model: &'static str,
    priority: u32,
}

const PROFILES: &[ProviderProfile] = &[
    ProviderProfile { key: "anthropic", name: "Claude", emoji: "🟣", model: "claude-sonnet-4-20250514", priority: 100 },
    ProviderProfile { key: "openrouter", name: "DeepSeek R1", emoji: "🔀", model: "deepseek/deepseek-r1-0528:free", priority: 90 },
    ProviderProfile { key: "openai", name: "GPT", emoji: "🟢", model: "gpt-4o", priority: 80 },
    ProviderProfile { key: "gemini", name: "Gemini", emoji: "💎", model: "gemini-2.0-flash", priority: 70 },
    ProviderProfile { key: "together", name: "Together", emoji: "🔵", model: "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo", priority: 60 },
    ProviderProfile { key: "groq", name: "Groq", emoji: "⚡", model: "llama-3.3-70b-versatile", priority: 50 },
    ProviderProfile { key: "zhipu", name: "Zhipu", emoji: "🇨🇳", model: "glm-4-flash", priority: 40 },
];

#[derive(Clone)]
pub(crate) struct Participant {
    pub(crate) name: String,
    pub(crate) emoji: String,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) model: Option<String>,
    pub(crate) priority: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DialogueExchange {
    pub(crate) speaker: String,
    pub(crate) emoji: String,
    pub(crate) round: usize,
    pub(crate) content: String,
    pub(crate) has_consensus: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct CollaborationResult {
    pub(crate) task: String,
    pub(crate) dialogue: Vec<DialogueExchange>,
    pub(crate) final_synthesis: String,
    pub(crate) providers_used: Vec<String>,
    pub(crate) rounds_completed: usize,
    pub(crate) consensus_reached: bool,
    pub(crate) success: bool,
    pub(crate) error: Option<String>,
}

pub(crate) struct Collaborator {
    participants: Vec<Participant>,
}

impl Collaborator {
    /// Participants are ranked by priority, highest first.
    pub(crate) fn new(mut participants: Vec<Participant>) -> Self {
        participants.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { participants }
    }

    /// Every known provider with an API key. Providers that fail to build are skipped.
    pub(crate) fn from_config(config: &FileConfig) -> Self {
        let mut participants = Vec::new();
        for profile in PROFILES {
            if config.api_key_for(profile.key).is_none() {
                continue;
            }
            match build_provider(config, profile.key) {
                Ok(provider) => {
                    let model = config
                        .provider(profile.key)
                        .and_then(|p| p.model.clone())
                        .unwrap_or_else(|| profile.model.to_string());
                    tracing::debug!(target: "collab", provider = profile.key, model = %model, "participant ready");
                    participants.push(Participant {
                        name: profile.name.to_string(),
                        emoji: profile.emoji.to_string(),
                        provider,
                        model: Some(model),
                        priority: profile.priority,
                    });
                }
                Err(e) => tracing::warn!(target: "collab", provider = profile.key, error = %e, "skipping provider"),
            }
        }
        Self::new(participants)
    }

    pub(crate) fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub(crate) fn provider_count(&self) -> usize {
        self.participants.len()
    }

    /// Run the dialogue. `progress` sees every exchange as display text.
    pub(crate) fn collaborate(&self, task: &str, progress: &dyn Fn(&str)) -> CollaborationResult {
        if self.participants.len() < 2 {
            return CollaborationResult {
                task: task.to_string(),
                dialogue: Vec::new(),
                final_synthesis: String::new(),
                providers_used: self.participants.iter().map(|p| p.name.clone()).collect(),
                rounds_completed: 0,
                consensus_reached: false,
                success: false,
                error: Some(format!("Need at least 2 providers. Found: {}", self.participants.len())),
            };
        }
        let a = &self.participants[0];
        let b = &self.participants[1];
        tracing::info!(target: "collab", first = %a.name, second = %b.name, "collaboration started");

        let mut dialogue = Vec::new();
        let mut round = 1;
        let mut consensus = false;

        let opening = ask(a, &opening_prompt(task), round, progress);
        push(&mut dialogue, a, round, opening);

        while round <= MAX_ROUNDS && !consensus {
            if self.exchange(task, b, a, round, &mut dialogue, progress) {
                consensus = true;
                break;
            }
            round += 1;
            if round <= MAX_ROUNDS && self.exchange(task, a, b, round, &mut dialogue, progress) {
                consensus = true;
                break;
            }
        }

        let prompt = synthesis_prompt(task, &dialogue);
        let synthesis = match chat_once(a, &prompt) {
            Ok(text) => {
                progress(&format!("✨ **Final Synthesis** (by {} {}):\n\n{text}", a.emoji, a.name));
                text
            }
            Err(e) => {
                tracing::error!(target: "collab", error = %e, "synthesis failed");
                format!("[Synthesis failed: {e}]")
            }
        };
        tracing::info!(target: "collab", rounds = round, consensus, "collaboration finished");

        CollaborationResult {
            task: task.to_string(),
            dialogue,
            final_synthesis: synthesis,
            providers_used: vec![a.name.clone(), b.name.clone()],
            rounds_completed: round,
            consensus_reached: consensus,
            success: true,
            error: None,
        }
    }

    /// `speaker` answers the dialogue; a marker sends the other side a confirmation prompt.
    /// True only when both emitted the marker.
    fn exchange(
        &self,
        task: &str,
        speaker: &Participant,
        other: &Participant,
        round: usize,
        dialogue: &mut Vec<DialogueExchange>,
        progress: &dyn Fn(&str),
    ) -> bool {
        let reply = ask(speaker, &response_prompt(task, dialogue, &speaker.name), round, progress);
        let agreed = push(dialogue, speaker, round, reply);
        if !agreed {
            return false;
        }
        let confirm = ask(other, &consensus_prompt(task, dialogue), round, progress);
        push(dialogue, other, round, confirm)
    }
}

fn push(dialogue: &mut Vec<DialogueExchange>, who: &Participant, round: usize, content: String) -> bool {
    let has_consensus = content.contains(CONSENSUS_MARKER);
    dialogue.push(DialogueExchange {
        speaker: who.name.clone(),
        emoji: who.emoji.clone(),
        round,
        content,
        has_consensus,
    });
    has_consensus
}

fn chat_once(who: &Participant, prompt: &str) -> Result<String, String> {
    let response = who
        .provider
        .chat(&[ChatMessage::user(prompt)], &[], who.model.as_deref());
    if response.is_error() {
        return Err(response.content.unwrap_or_else(|| "unknown provider error".into()));
    }
    Ok(response.content.unwrap_or_default())
}

/// One turn. Failures are folded into the dialogue as `[Error: …]`.
fn ask(who: &Participant, prompt: &str, round: usize, progress: &dyn Fn(&str)) -> String {
    match chat_once(who, prompt) {
        Ok(text) => {
            let marker = if text.contains(CONSENSUS_MARKER) { " ✅" } else { "" };
            progress(&format!("{} **{}** (Round {round}){marker}:\n\n{text}", who.emoji, who.name));
            text
        }
        Err(e) => {
            tracing::warn!(target: "collab", provider = %who.name, error = %e, "provider failed");
            let text = format!("[Error: {e}]");
            progress(&format!("{} **{}**: {text}", who.emoji, who.name));
            text
        }
    }
}

fn format_history(dialogue: &[DialogueExchange]) -> String {
    dialogue
        .iter()
        .map(|ex| {
            let check = if ex.has_consensus { " ✓" } else { "" };
            format!("**{} {} (Round {}){check}**:\n{}", ex.emoji, ex.speaker, ex.round, ex.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn opening_prompt(task: &str) -> String {
    format!(
        "You are collaborating with another AI model to find the best solution to a task.\n\
         You will have a back-and-forth discussion, building on each other's ideas.\n\n\
         **TASK**: {task}\n\n\
         **YOUR ROLE**: Propose an initial solution. Be thorough but concise.\n\n\
         **DIALOGUE RULES**:\n\
         - Be specific and provide reasoning\n\
         - The other model will critique and add ideas\n\
         - You'll refine based on their feedback\n\
         - When you believe the solution is complete and optimal, include {CONSENSUS_MARKER} in your response\n\
         - Keep responses focused (max 400 words)\n\n\
         Now provide your initial proposal:"
    )
}

fn response_prompt(task: &str, dialogue: &[DialogueExchange], responder: &str) -> String {
    format!(
        "You are collaborating with another AI model to find the best solution to a task.\n\n\
         **TASK**: {task}\n\n\
         **DIALOGUE SO FAR**:\n{}\n\n\
         **YOUR ROLE** ({responder}):\n\
         Continue the discussion. You should:\n\
         1. **Acknowledge** good points from the previous response\n\
         2. **Question** anything unclear or potentially problematic\n\
         3. **Add** your own ideas or improvements\n\
         4. **Refine** the proposed solution\n\n\
         If you believe the current solution is optimal and complete, include {CONSENSUS_MARKER} in your response to signal consensus.\n\n\
         Keep your response focused (max 400 words). Be constructive and specific.\n\n\
         Your response:",
        format_history(dialogue)
    )
}

fn consensus_prompt(task: &str, dialogue: &[DialogueExchange]) -> String {
    format!(
        "You are collaborating with another AI model.\n\n\
         **TASK**: {task}\n\n\
         **DIALOGUE SO FAR**:\n{}\n\n\
         The other model has signaled they're satisfied with the solution ({CONSENSUS_MARKER}).\n\n\
         **Do you agree the solution is now optimal?**\n\
         - If YES: Say {CONSENSUS_MARKER} and briefly confirm why the solution is good\n\
         - If NO: Explain what's still missing or needs refinement\n\n\
         Your response (max 200 words):",
        format_history(dialogue)
    )
}

fn synthesis_prompt(task: &str, dialogue: &[DialogueExchange]) -> String {
    format!(
        "You participated in a collaborative discussion to solve a task.\n\n\
         **TASK**: {task}\n\n\
         **FULL DIALOGUE**:\n{}\n\n\
         Now create the **FINAL SOLUTION** that:\n\
         1. Takes the best ideas from the entire discussion\n\
         2. Addresses all concerns that were raised\n\
         3. Is actionable and complete\n\
         4. Represents the collaborative consensus\n\n\
         Provide a clear, well-structured final answer:",
        format_history(dialogue)
    )
}

/// The chat reply summarizing a finished collaboration.
pub(crate) fn summarize_result(result: &CollaborationResult) -> String {
    if !result.success {
        return format!(
            "❌ **Collaboration Failed**\n\n{}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    let status = if result.consensus_reached {
        "✅ Consensus reached!".to_string()
    } else {
        format!("⏱️ Max rounds ({}) completed", result.rounds_completed)
    };
    format!(
        "🏁 **Collaboration Complete**\n\n**Rounds:** {}\n**Status:** {status}\n**Models:** {}",
        result.rounds_completed,
        result.providers_used.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmResponse, ToolDefinition};
    use std::sync::Mutex;

    /// Replies from a script, one per call, repeating the last line when it runs out.
    struct Scripted {
        replies: Vec<&'static str>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self { replies, calls: Mutex::new(0) })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn default_model(&self) -> String {
            "scripted".into()
        }
        fn chat(&self, _messages: &[ChatMessage], _tools: &[ToolDefinition], _model: Option<&str>) -> LlmResponse {
            let mut calls = self.calls.lock().unwrap();
            let reply = self.replies.get(*calls).or(self.replies.last()).copied().unwrap_or("");
            *calls += 1;
            if let Some(err) = reply.strip_prefix("ERR:") {
                return LlmResponse::error(err.to_string());
            }
            LlmResponse::text(reply)
        }
    }

    fn participant(name: &str, priority: u32, provider: Arc<Scripted>) -> Participant {
        Participant {
            name: name.into(),
            emoji: "•".into(),
            provider,
            model: None,
            priority,
        }
    }

    #[test]
    fn test_needs_two_providers() {
        let solo = Scripted::new(vec!["hi"]);
        let collab = Collaborator::new(vec![participant("Solo", 10, solo.clone())]);
        let result = collab.collaborate("task", &|_| {});
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Need at least 2 providers. Found: 1"));
        assert_eq!(solo.calls(), 0);
        assert!(summarize_result(&result).starts_with("❌ **Collaboration Failed**"));
    }

    #[test]
    fn test_consensus_requires_both_sides() {
        // B agrees every time, A never does: no consensus, dialogue runs to the limit.
        let a = Scripted::new(vec!["still refining"]);
        let b = Scripted::new(vec!["looks good [AGREED]"]);
        let collab = Collaborator::new(vec![participant("B", 50, b), participant("A", 100, a)]);
        let result = collab.collaborate("design an API", &|_| {});
        assert!(result.success);
        assert!(!result.consensus_reached);
        assert_eq!(result.providers_used, vec!["A", "B"]);
        assert_eq!(result.rounds_completed, MAX_ROUNDS + 1);
        assert!(summarize_result(&result).contains("Max rounds"));
    }

    #[test]
    fn test_mutual_agreement_stops_early() {
        let a = Scripted::new(vec!["proposal", "[AGREED] confirmed", "final answer"]);
        let b = Scripted::new(vec!["nice [AGREED]"]);
        let collab = Collaborator::new(vec![participant("A", 100, a.clone()), participant("B", 50, b.clone())]);
        let seen = Mutex::new(Vec::new());
        let result = collab.collaborate("task", &|text| seen.lock().unwrap().push(text.to_string()));
        assert!(result.consensus_reached);
        assert_eq!(result.rounds_completed, 1);
        assert_eq!(result.dialogue.len(), 3);
        assert_eq!(result.final_synthesis, "final answer");
        assert_eq!((a.calls(), b.calls()), (3, 1));
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen[3].starts_with("✨ **Final Synthesis** (by • A)"));
        assert!(summarize_result(&result).contains("✅ Consensus reached!"));
    }

    #[test]
    fn test_provider_errors_join_the_dialogue() {
        let a = Scripted::new(vec!["ERR:rate limited", "[AGREED]", "summary"]);
        let b = Scripted::new(vec!["[AGREED]"]);
        let collab = Collaborator::new(vec![participant("A", 100, a), participant("B", 50, b)]);
        let result = collab.collaborate("task", &|_| {});
        assert_eq!(result.dialogue[0].content, "[Error: rate limited]");
        assert!(result.consensus_reached);
    }
}
