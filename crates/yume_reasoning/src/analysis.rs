//! Message classification through the completion service.
//!
//! Each classifier asks for exactly one label. Anything unusable (service
//! failure, unknown label) degrades to a neutral answer instead of an error.

use crate::policy::CompletionPolicy;
use crate::text::normalize_label;
use std::fmt;

const EMOTION_PROMPT: &str = "请帮我分析下这段话的情感，并在下面六个选项中选择：开心，生气，中性，哲学，敷衍，难过，\
并只回复选项，例如：\"user: 哈哈哈\" resp: \"开心\"，不需要回答多余的内容，也不需要添加分号";

const INTENTION_PROMPT: &str = "请帮我分析下这段话的意图，并在下面六个选项中选择：想和对方聊天，想被对方鼓励，想和对方倾诉，安慰对方，鼓励对方，和对方道歉，\
并只回复选项，例如：\"user: 能陪我会儿吗\" resp: \"想和对方倾诉\"，不需要回答多余的内容，也不需要添加分号";

const FAREWELL_PROMPT: &str = "你是一个聊天意图分析助手。当前用户正在与AI进行长对话，请分析用户的这句话是否想要结束当前对话。

判断标准：
【想结束对话】的信号：
- 明确的告别词：再见、拜拜、88、bye、晚安、睡了等
- 表达要离开：我走了、我去忙了、先这样吧、不聊了等
- 礼貌性结束：谢谢你、辛苦了、今天就到这里等

【想继续】的信号：
- 提出新话题：对了、话说、还有等
- 表达疑惑但想了解：什么意思、为什么、怎么回事等
- 简单回应：哈哈、嗯、好的、是的等
- 暂停性词语：等等、稍等、让我想想等
- 单个字符、表情符号、语气词等

注意：当意图不明确时，倾向于判断为\"想继续\"，避免误结束有价值的对话。

请在以下两个选项中选择：想继续，想结束对话

示例：
\"哈哈哈\" → \"想继续\"
\"拜拜啦\" → \"想结束对话\"
\"等等\" → \"想继续\"
\"我去吃饭了\" → \"想结束对话\"
\"谢谢你今天陪我聊天\" → \"想结束对话\"
\"对了还有个问题\" → \"想继续\"

只回复选项，不需要其他内容。";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emotion {
    Happy,
    Angry,
    Neutral,
    Philosophical,
    Perfunctory,
    Sad,
}

impl Emotion {
    pub fn label(&self) -> &'static str {
        match self {
            Emotion::Happy => "开心",
            Emotion::Angry => "生气",
            Emotion::Neutral => "中性",
            Emotion::Philosophical => "哲学",
            Emotion::Perfunctory => "敷衍",
            Emotion::Sad => "难过",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let label = normalize_label(label);
        [
            Emotion::Happy,
            Emotion::Angry,
            Emotion::Neutral,
            Emotion::Philosophical,
            Emotion::Perfunctory,
            Emotion::Sad,
        ]
        .into_iter()
        .find(|e| e.label() == label)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intention {
    WantsToChat,
    WantsEncouragement,
    WantsToConfide,
    Comforting,
    Encouraging,
    Apologizing,
}

impl Intention {
    pub fn label(&self) -> &'static str {
        match self {
            Intention::WantsToChat => "想和对方聊天",
            Intention::WantsEncouragement => "想被对方鼓励",
            Intention::WantsToConfide => "想和对方倾诉",
            Intention::Comforting => "安慰对方",
            Intention::Encouraging => "鼓励对方",
            Intention::Apologizing => "和对方道歉",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let label = normalize_label(label);
        [
            Intention::WantsToChat,
            Intention::WantsEncouragement,
            Intention::WantsToConfide,
            Intention::Comforting,
            Intention::Encouraging,
            Intention::Apologizing,
        ]
        .into_iter()
        .find(|i| i.label() == label)
    }

    /// Signals a wish for a sustained conversation.
    pub fn wants_long_chat(&self) -> bool {
        matches!(self, Intention::WantsToChat | Intention::WantsToConfide)
    }
}

impl fmt::Display for Intention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifiers backed by the policy engine.
pub struct Analyzer<'a> {
    policy: &'a CompletionPolicy,
}

impl<'a> Analyzer<'a> {
    pub fn new(policy: &'a CompletionPolicy) -> Self {
        Self { policy }
    }

    /// Falls back to 中性.
    pub async fn emotion(&self, message: &str) -> Emotion {
        match self.policy.ask(EMOTION_PROMPT, message).await {
            Ok(answer) => Emotion::parse(&answer).unwrap_or_else(|| {
                tracing::debug!("Unrecognised emotion label {:?}", answer);
                Emotion::Neutral
            }),
            Err(e) => {
                tracing::warn!("Emotion analysis failed, assuming 中性: {}", e);
                Emotion::Neutral
            }
        }
    }

    /// `None` when the service fails or answers outside the label set.
    pub async fn intention(&self, message: &str) -> Option<Intention> {
        match self.policy.ask(INTENTION_PROMPT, message).await {
            Ok(answer) => {
                let parsed = Intention::parse(&answer);
                if parsed.is_none() {
                    tracing::debug!("Unrecognised intention label {:?}", answer);
                }
                parsed
            }
            Err(e) => {
                tracing::warn!("Intention analysis failed: {}", e);
                None
            }
        }
    }

    /// Whether the user wants to end a long chat. Falls back to 想继续.
    pub async fn wants_to_end(&self, message: &str) -> bool {
        match self.policy.ask(FAREWELL_PROMPT, message).await {
            Ok(answer) => normalize_label(&answer) == "想结束对话",
            Err(e) => {
                tracing::warn!("Farewell analysis failed, assuming 想继续: {}", e);
                false
            }
        }
    }
}
