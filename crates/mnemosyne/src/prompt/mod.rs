//! Memory block injection and cleanup for chat requests
//!
//! Retrieved memories are spliced into outgoing requests as a tagged block.
//! Before every injection the request is scrubbed of stale blocks left by
//! earlier turns, so repeated round-trips never accumulate memory text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::session::{Role, Turn};
use crate::storage::MemoryHit;

/// Matches a complete memory block, including its markers
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<Mnemosyne>.*?</Mnemosyne>").expect("memory block regex is valid")
});

/// Content of a context entry: plain text, or an opaque rich payload
/// (images, tool results) that cleanup must never touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryContent {
    Text(String),
    Rich(serde_json::Value),
}

impl EntryContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EntryContent::Text(text) => Some(text),
            EntryContent::Rich(_) => None,
        }
    }
}

/// One prior message carried in the request context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    pub content: EntryContent,
}

impl ContextEntry {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: EntryContent::Text(content.into()),
        }
    }
}

impl From<&Turn> for ContextEntry {
    fn from(turn: &Turn) -> Self {
        ContextEntry::text(turn.role, turn.content.clone())
    }
}

/// An outgoing chat request, as seen right before it leaves for the LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The current user message
    pub prompt: String,
    /// Standing system prompt, if the caller set one
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Prior conversation messages, oldest first
    #[serde(default)]
    pub context: Vec<ContextEntry>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            context: Vec::new(),
        }
    }
}

/// Where the memory block lands in the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMethod {
    /// Prepended to the current user message
    UserPrompt,
    /// Appended to the standing system prompt
    SystemPrompt,
    /// Appended as a dedicated system entry in the context
    InsertSystemPrompt,
}

impl InjectionMethod {
    /// Parse a configured method name, degrading to `UserPrompt` on
    /// anything unrecognized.
    pub fn from_name(name: &str) -> Self {
        match name {
            "user_prompt" => InjectionMethod::UserPrompt,
            "system_prompt" => InjectionMethod::SystemPrompt,
            "insert_system_prompt" => InjectionMethod::InsertSystemPrompt,
            other => {
                tracing::warn!(
                    method = other,
                    "Unknown injection method, falling back to user_prompt"
                );
                InjectionMethod::UserPrompt
            }
        }
    }
}

/// Formats retrieved memories and manages the block lifecycle inside
/// requests.
pub struct MemoryInjector {
    method: InjectionMethod,
    /// Blocks retained per cleanup: negative keeps all, zero keeps none
    retention: i32,
    block_prefix: String,
    block_suffix: String,
    entry_format: String,
}

impl MemoryInjector {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            method: InjectionMethod::from_name(&config.injection_method),
            retention: config.retention_length,
            block_prefix: config.block_prefix.clone(),
            block_suffix: config.block_suffix.clone(),
            entry_format: config.entry_format.clone(),
        }
    }

    pub fn method(&self) -> InjectionMethod {
        self.method
    }

    /// Render hits into a single tagged block. Empty input yields an empty
    /// string.
    pub fn format_block(&self, hits: &[MemoryHit]) -> String {
        if hits.is_empty() {
            return String::new();
        }

        let entries: Vec<String> = hits
            .iter()
            .map(|hit| {
                let time = hit.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
                self.entry_format
                    .replace("{time}", &time)
                    .replace("{content}", &hit.content)
            })
            .collect();

        format!(
            "{}\n{}\n{}",
            self.block_prefix,
            entries.join("\n"),
            self.block_suffix
        )
    }

    /// Strip stale memory blocks from the request according to the retention
    /// policy. Exactly one field set is scanned, chosen by the injection
    /// method: user-role entries, the system prompt string, or system-role
    /// entries (which are whole memory blocks, kept or dropped atomically).
    /// Rich-content entries are never modified.
    pub fn cleanup(&self, request: &mut ChatRequest) {
        if self.retention < 0 {
            return;
        }

        match self.method {
            InjectionMethod::UserPrompt => self.cleanup_user_entries(request),
            InjectionMethod::SystemPrompt => {
                if let Some(system) = request.system_prompt.as_mut() {
                    if TAG_RE.is_match(system) {
                        *system = scrub(system, self.retention);
                    }
                }
            }
            InjectionMethod::InsertSystemPrompt => self.cleanup_system_entries(request),
        }
    }

    fn cleanup_user_entries(&self, request: &mut ChatRequest) {
        // Keep-set over every user entry, so retention spans the whole
        // context rather than resetting per message
        let all_blocks: Vec<String> = request
            .context
            .iter()
            .filter(|entry| entry.role == Role::User)
            .filter_map(|entry| entry.content.as_text())
            .flat_map(|text| TAG_RE.find_iter(text).map(|m| m.as_str().to_string()))
            .collect();

        let keep = keep_set(&all_blocks, self.retention);

        for entry in request.context.iter_mut() {
            if entry.role != Role::User {
                continue;
            }
            if let EntryContent::Text(text) = &mut entry.content {
                if TAG_RE.is_match(text) {
                    let cleaned = TAG_RE.replace_all(text, |caps: &regex::Captures| {
                        let block = &caps[0];
                        if keep.contains(block) {
                            block.to_string()
                        } else {
                            String::new()
                        }
                    });
                    *text = cleaned.into_owned();
                }
            }
        }
    }

    /// System-role entries are injected memory blocks in their entirety:
    /// drop the oldest until only `retention` remain, preserving the order
    /// of everything else.
    fn cleanup_system_entries(&self, request: &mut ChatRequest) {
        let system_count = request
            .context
            .iter()
            .filter(|entry| entry.role == Role::System)
            .count();
        let keep = self.retention as usize;
        if system_count <= keep {
            return;
        }

        let mut to_drop = system_count - keep;
        request.context.retain(|entry| {
            if entry.role == Role::System && to_drop > 0 {
                to_drop -= 1;
                return false;
            }
            true
        });
    }

    /// Clean the request, then splice the rendered block in at the
    /// configured position. No hits means cleanup only.
    pub fn inject(&self, request: &mut ChatRequest, hits: &[MemoryHit]) {
        self.cleanup(request);

        if hits.is_empty() {
            return;
        }

        let block = self.format_block(hits);
        match self.method {
            InjectionMethod::UserPrompt => {
                request.prompt = format!("{}\n\n{}", block, request.prompt);
            }
            InjectionMethod::SystemPrompt => {
                request.system_prompt = Some(match request.system_prompt.take() {
                    Some(existing) if !existing.is_empty() => {
                        format!("{existing}\n\n{block}")
                    }
                    _ => block,
                });
            }
            InjectionMethod::InsertSystemPrompt => {
                request.context.push(ContextEntry::text(Role::System, block));
            }
        }
    }
}

/// Apply the retention policy to a single string with its own keep-set.
fn scrub(text: &str, retention: i32) -> String {
    let blocks: Vec<String> = TAG_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    let keep = keep_set(&blocks, retention);

    TAG_RE
        .replace_all(text, |caps: &regex::Captures| {
            let block = &caps[0];
            if keep.contains(block) {
                block.to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// The distinct block texts that survive cleanup: the last `retention`
/// occurrences, deduplicated.
fn keep_set(blocks: &[String], retention: i32) -> HashSet<String> {
    if retention <= 0 {
        return HashSet::new();
    }
    let skip = blocks.len().saturating_sub(retention as usize);
    blocks[skip..].iter().cloned().collect()
}

/// Render turns for summarization: each line is `role:content`, most recent
/// turns last.
pub fn format_transcript(turns: &[Turn]) -> String {
    let lines: Vec<String> = turns
        .iter()
        .filter(|t| matches!(t.role, Role::User | Role::Assistant))
        .map(|t| format!("{}:{}\n", t.role.as_str(), t.content))
        .collect();
    lines.join("\n")
}
