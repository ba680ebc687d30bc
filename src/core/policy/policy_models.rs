// Per-guild policy - what the dashboard edits and the pipeline reads.
//
// A policy is stored as one JSON document per section. Every field has a
// serde default so a guild with no saved configuration still gets a usable
// (mostly disabled) policy.

use crate::core::moderation::{ActionType, SuggestedAction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Longest rate window accepted at save time.
pub const MAX_WINDOW_SECONDS: u64 = 3600;
/// Longest timeout the platform accepts (28 days).
pub const MAX_TIMEOUT_SECONDS: u64 = 28 * 24 * 60 * 60;

// ============================================================================
// ENUMS
// ============================================================================

/// How messages are routed between keyword rules and the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Classifier sees every message; rule matches are informational.
    #[default]
    All,
    /// Classifier only runs when a keyword rule matched.
    RulesOnly,
    /// A matching rule decides on its own; otherwise behave like `All`.
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    #[default]
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidAutoAction {
    #[default]
    None,
    Lockdown,
    KickNew,
    BanNew,
}

/// Named sections of a stored policy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicySection {
    General,
    Moderation,
    Ai,
    BotDetection,
    RaidDefense,
    MessageRate,
    Logging,
    Channels,
    Verification,
}

impl PolicySection {
    pub const ALL: [PolicySection; 9] = [
        PolicySection::General,
        PolicySection::Moderation,
        PolicySection::Ai,
        PolicySection::BotDetection,
        PolicySection::RaidDefense,
        PolicySection::MessageRate,
        PolicySection::Logging,
        PolicySection::Channels,
        PolicySection::Verification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicySection::General => "general",
            PolicySection::Moderation => "moderation",
            PolicySection::Ai => "ai",
            PolicySection::BotDetection => "bot_detection",
            PolicySection::RaidDefense => "raid_defense",
            PolicySection::MessageRate => "message_rate",
            PolicySection::Logging => "logging",
            PolicySection::Channels => "channels",
            PolicySection::Verification => "verification",
        }
    }
}

impl fmt::Display for PolicySection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicySection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        PolicySection::ALL
            .into_iter()
            .find(|section| section.as_str() == normalized)
            .ok_or_else(|| format!("unknown policy section '{}'", s))
    }
}

// ============================================================================
// RULES
// ============================================================================

/// A keyword/regex matcher plus free-text guidance for the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default, alias = "regex")]
    pub regex_patterns: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    /// Outcome used when this rule decides on its own (override mode).
    #[serde(default = "default_rule_action")]
    pub action: SuggestedAction,
}

fn default_rule_action() -> SuggestedAction {
    SuggestedAction::Warn
}

impl KeywordRule {
    /// Label recorded as the violated rule.
    pub fn label(&self) -> String {
        if self.name.trim().is_empty() {
            "keyword rule".to_string()
        } else {
            self.name.clone()
        }
    }
}

/// What a classifier suggestion turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityOutcome {
    pub action: ActionType,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

fn default_severity() -> HashMap<SuggestedAction, SeverityOutcome> {
    let outcome = |action, duration_seconds| SeverityOutcome {
        action,
        duration_seconds,
    };
    HashMap::from([
        (SuggestedAction::Warn, outcome(ActionType::Warn, None)),
        (
            SuggestedAction::TimeoutShort,
            outcome(ActionType::Timeout, Some(10 * 60)),
        ),
        (
            SuggestedAction::TimeoutMedium,
            outcome(ActionType::Timeout, Some(60 * 60)),
        ),
        (
            SuggestedAction::TimeoutLong,
            outcome(ActionType::Timeout, Some(24 * 60 * 60)),
        ),
        (SuggestedAction::Kick, outcome(ActionType::Kick, None)),
        (SuggestedAction::Ban, outcome(ActionType::Ban, None)),
    ])
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub enabled: bool,
    /// Forces every action through manual confirmation.
    pub test_mode: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            test_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationSettings {
    pub action_confirmation: HashMap<ActionType, ConfirmationMode>,
    /// Role pinged when a manual confirmation is requested or expires.
    pub confirmation_ping_target: Option<u64>,
    /// Channel confirmation requests are posted to (falls back to the mod log).
    pub confirmation_channel: Option<u64>,
    pub confirmation_timeout_seconds: u64,
    pub mod_log_channel: Option<u64>,
    pub error_notification_target: Option<u64>,
    pub severity: HashMap<SuggestedAction, SeverityOutcome>,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            action_confirmation: HashMap::new(),
            confirmation_ping_target: None,
            confirmation_channel: None,
            confirmation_timeout_seconds: 300,
            mod_log_channel: None,
            error_notification_target: None,
            severity: default_severity(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub analysis_mode: AnalysisMode,
    pub keyword_rules: Vec<KeywordRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotDetectionSettings {
    pub enabled: bool,
    pub keywords: Vec<String>,
    pub action: ActionType,
    pub timeout_seconds: u64,
    pub whitelist_users: Vec<u64>,
    pub whitelist_roles: Vec<u64>,
}

impl Default for BotDetectionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            keywords: DEFAULT_SCAM_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            action: ActionType::Warn,
            timeout_seconds: 300,
            whitelist_users: Vec::new(),
            whitelist_roles: Vec::new(),
        }
    }
}

const DEFAULT_SCAM_KEYWORDS: &[&str] = &[
    "free nitro",
    "nitro gift",
    "claim nitro",
    "discord.gift",
    "free steam",
    "steam gift",
    "free skins",
    "steamcommunlty",
    "crypto giveaway",
    "bitcoin giveaway",
    "free crypto",
    "guaranteed profit",
    "double your money",
    "crypto airdrop",
    "free nft",
    "verify your account",
    "account suspended",
    "urgent action required",
    "congratulations you won",
    "discord support",
    "discord staff",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidDefenseSettings {
    pub enabled: bool,
    pub join_threshold: u64,
    pub join_timeframe_seconds: u64,
    pub auto_action: RaidAutoAction,
    pub alert_channel: Option<u64>,
}

impl Default for RaidDefenseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            join_threshold: 10,
            join_timeframe_seconds: 60,
            auto_action: RaidAutoAction::None,
            alert_channel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRateSettings {
    pub enabled: bool,
    /// Channels under automatic slowmode. Empty means every tracked channel.
    pub channels: Vec<u64>,
    pub high_rate_threshold: u64,
    pub low_rate_threshold: u64,
    pub high_rate_slowmode_seconds: u64,
    pub low_rate_slowmode_seconds: u64,
    pub check_interval_seconds: u64,
    pub analysis_window_seconds: u64,
    pub notifications_enabled: bool,
    pub notification_channel: Option<u64>,
}

impl Default for MessageRateSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            channels: Vec::new(),
            high_rate_threshold: 10,
            low_rate_threshold: 3,
            high_rate_slowmode_seconds: 5,
            low_rate_slowmode_seconds: 2,
            check_interval_seconds: 30,
            analysis_window_seconds: 60,
            notifications_enabled: false,
            notification_channel: None,
        }
    }
}

impl MessageRateSettings {
    pub fn covers_channel(&self, channel_id: u64) -> bool {
        self.channels.is_empty() || self.channels.contains(&channel_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_channel: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub excluded_channels: Vec<u64>,
    /// Extra classifier guidance for specific channels.
    pub channel_rules: HashMap<u64, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub fail_action: ActionType,
    pub timeout_duration_seconds: Option<u64>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            fail_action: ActionType::Kick,
            timeout_duration_seconds: None,
        }
    }
}

// ============================================================================
// POLICY
// ============================================================================

/// Full per-guild policy snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildPolicy {
    pub guild_id: u64,
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub moderation: ModerationSettings,
    #[serde(default)]
    pub ai: AiSettings,
    #[serde(default)]
    pub bot_detection: BotDetectionSettings,
    #[serde(default)]
    pub raid_defense: RaidDefenseSettings,
    #[serde(default)]
    pub message_rate: MessageRateSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub channels: ChannelSettings,
    #[serde(default)]
    pub verification: VerificationSettings,
}

impl GuildPolicy {
    pub fn default_for(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    pub fn confirmation_mode(&self, action: ActionType) -> ConfirmationMode {
        if self.general.test_mode {
            return ConfirmationMode::Manual;
        }
        self.moderation
            .action_confirmation
            .get(&action)
            .copied()
            .unwrap_or_default()
    }

    /// Where confirmation requests and moderator notices go.
    pub fn notice_channel(&self) -> Option<u64> {
        self.moderation
            .confirmation_channel
            .or(self.moderation.mod_log_channel)
            .or(self.logging.log_channel)
    }

    /// Where fatal and permission errors are reported.
    pub fn error_channel(&self) -> Option<u64> {
        self.moderation
            .error_notification_target
            .or(self.moderation.mod_log_channel)
            .or(self.logging.log_channel)
    }

    pub fn is_channel_excluded(&self, channel_id: u64) -> bool {
        self.channels.excluded_channels.contains(&channel_id)
    }

    pub fn section_value(&self, section: PolicySection) -> serde_json::Result<serde_json::Value> {
        match section {
            PolicySection::General => serde_json::to_value(&self.general),
            PolicySection::Moderation => serde_json::to_value(&self.moderation),
            PolicySection::Ai => serde_json::to_value(&self.ai),
            PolicySection::BotDetection => serde_json::to_value(&self.bot_detection),
            PolicySection::RaidDefense => serde_json::to_value(&self.raid_defense),
            PolicySection::MessageRate => serde_json::to_value(&self.message_rate),
            PolicySection::Logging => serde_json::to_value(&self.logging),
            PolicySection::Channels => serde_json::to_value(&self.channels),
            PolicySection::Verification => serde_json::to_value(&self.verification),
        }
    }

    /// Replace one section from its JSON document.
    pub fn apply_section(
        &mut self,
        section: PolicySection,
        value: serde_json::Value,
    ) -> serde_json::Result<()> {
        match section {
            PolicySection::General => self.general = serde_json::from_value(value)?,
            PolicySection::Moderation => self.moderation = serde_json::from_value(value)?,
            PolicySection::Ai => self.ai = serde_json::from_value(value)?,
            PolicySection::BotDetection => self.bot_detection = serde_json::from_value(value)?,
            PolicySection::RaidDefense => self.raid_defense = serde_json::from_value(value)?,
            PolicySection::MessageRate => self.message_rate = serde_json::from_value(value)?,
            PolicySection::Logging => self.logging = serde_json::from_value(value)?,
            PolicySection::Channels => self.channels = serde_json::from_value(value)?,
            PolicySection::Verification => self.verification = serde_json::from_value(value)?,
        }
        Ok(())
    }
}
