use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tokio::fs;

/// Channel conventions prepended to every character prompt.
const BASE_PROMPT: &str = "\
你正在通过QQ和对方私聊。\
回复要简短、口语化，像真人发消息一样，不要使用 Markdown。\
如果想分成几条消息发送，用 $ 分隔。\n\n";

/// Character card: the persona the bot plays, loaded from
/// `<persona_dir>/<name>.json`.
///
/// Maps are ordered so the rendered prompt is stable between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub personality: BTreeMap<String, String>,
    /// Either a plain string or a nested map of strings / string lists.
    #[serde(default)]
    pub behavior: BTreeMap<String, Value>,
    /// Situation → example replies.
    #[serde(default)]
    pub responses: BTreeMap<String, Value>,
    #[serde(default)]
    pub quotes: Vec<String>,
}

impl Default for Character {
    fn default() -> Self {
        Self {
            name: "Yume".to_string(),
            description: "一个温柔、有点黏人的朋友，喜欢和对方聊天。".to_string(),
            personality: BTreeMap::new(),
            behavior: BTreeMap::new(),
            responses: BTreeMap::new(),
            quotes: Vec::new(),
        }
    }
}

impl Character {
    /// Load a character card from `dir/<name>.json`.
    pub async fn load<P: AsRef<Path>>(dir: P, name: &str) -> anyhow::Result<Self> {
        let path = dir.as_ref().join(format!("{}.json", name));
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read character {}: {}", path.display(), e))?;
        let character: Character = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse character {}: {}", path.display(), e))?;
        Ok(character)
    }

    /// Like [`Character::load`], but a missing or broken card degrades to the
    /// built-in default.
    pub async fn load_or_default<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        match Self::load(dir, name).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("{}; falling back to built-in character", e);
                Self::default()
            }
        }
    }

    /// Render the role-play instructions for this character.
    pub fn render(&self) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "你是{}，{}\n", self.name, self.description);

        if !self.personality.is_empty() {
            prompt.push_str("【性格特征】\n");
            for (key, value) in &self.personality {
                let _ = writeln!(prompt, "- {}: {}", key, value);
            }
            prompt.push('\n');
        }

        if !self.behavior.is_empty() {
            prompt.push_str("【行为特征】\n");
            for (key, value) in &self.behavior {
                match value {
                    Value::String(s) => {
                        let _ = writeln!(prompt, "- {}: {}", key, s);
                    }
                    Value::Object(map) => {
                        let _ = writeln!(prompt, "- {}:", key);
                        let mut entries: Vec<_> = map.iter().collect();
                        entries.sort_by(|a, b| a.0.cmp(b.0));
                        for (sub_key, sub_value) in entries {
                            match sub_value {
                                Value::String(s) => {
                                    let _ = writeln!(prompt, "  * {}: {}", sub_key, s);
                                }
                                Value::Array(items) => {
                                    let joined = items
                                        .iter()
                                        .map(display_value)
                                        .collect::<Vec<_>>()
                                        .join(", ");
                                    let _ = writeln!(prompt, "  * {}: {}", sub_key, joined);
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            prompt.push('\n');
        }

        if !self.responses.is_empty() {
            prompt.push_str("【回复风格】\n");
            for (key, value) in &self.responses {
                if let Value::Array(examples) = value {
                    let _ = writeln!(prompt, "- {}时的回复示例:", key);
                    for example in examples {
                        let _ = writeln!(prompt, "  * \"{}\"", display_value(example));
                    }
                }
            }
            prompt.push('\n');
        }

        if !self.quotes.is_empty() {
            prompt.push_str("【经典语录】\n");
            for quote in &self.quotes {
                let _ = writeln!(prompt, "- \"{}\"", quote);
            }
            prompt.push('\n');
        }

        prompt.push_str("【角色扮演要求】\n");
        prompt.push_str("请严格按照以上角色设定进行对话，保持角色的一致性和真实感。\n");
        prompt.push_str("回复时要体现出角色的性格特点、说话风格和行为习惯。");
        prompt
    }

    /// Full system prompt: channel conventions, operator extras, then the character.
    pub fn system_prompt(&self, extra: &str) -> String {
        let mut prompt = String::from(BASE_PROMPT);
        if !extra.trim().is_empty() {
            prompt.push_str(extra.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str(&self.render());
        prompt
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
