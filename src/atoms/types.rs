// ── Chatvend Atoms: Domain Types ───────────────────────────────────────────
// Entities, status enums, and the invariant-enforcing constructors.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.
//
// Conventions:
//   • Identifiers are opaque UUID-v4 strings.
//   • Timestamps are `DateTime<Utc>`; the store persists RFC 3339 text.
//   • Money is integer IRR; credits and token prices are integer
//     micro-IRR (1e-6 IRR) so per-token arithmetic never rounds.
//   • Status enums round-trip through their lowercase text form, which is
//     exactly what the store persists.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::atoms::error::{EngineError, EngineResult};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Status enums ───────────────────────────────────────────────────────────

macro_rules! text_status {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EngineError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::InvalidArgument(format!(
                        concat!("unknown ", stringify!($name), ": {}"), other
                    ))),
                }
            }
        }
    };
}

text_status!(RegistrationStatus {
    Pending => "pending",
    Completed => "completed",
});

text_status!(SubscriptionStatus {
    Reserved => "reserved",
    Active => "active",
    Finished => "finished",
    Cancelled => "cancelled",
});

text_status!(PaymentStatus {
    Initiated => "initiated",
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl PaymentStatus {
    /// Succeeded, failed and cancelled admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

text_status!(ChatSessionStatus {
    Active => "active",
    Finished => "finished",
});

text_status!(ChatRole {
    User => "user",
    Assistant => "assistant",
    System => "system",
});

text_status!(AiJobStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

// ── Users & privacy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacySettings {
    /// When false, user turns are never written to the message log; the
    /// text rides on the AI job payload instead.
    pub allow_message_storage: bool,
    /// When true, the retention purge deletes messages older than
    /// `retention_days`.
    pub auto_delete: bool,
    pub retention_days: u32,
    /// When true, stored message content is AES-GCM ciphertext.
    pub data_encrypted: bool,
    pub encryption_key_id: Option<String>,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        PrivacySettings {
            allow_message_storage: true,
            auto_delete: false,
            retention_days: 30,
            data_encrypted: false,
            encryption_key_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Telegram user id. Unique and positive.
    pub tg_user_id: i64,
    pub display_name: String,
    pub registration_status: RegistrationStatus,
    pub is_admin: bool,
    pub privacy: PrivacySettings,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl User {
    /// A user record is created on first contact, pending until the
    /// privacy policy is accepted.
    pub fn new(tg_user_id: i64, display_name: impl Into<String>) -> EngineResult<Self> {
        if tg_user_id <= 0 {
            return Err(EngineError::InvalidArgument(format!(
                "telegram user id must be positive, got {}",
                tg_user_id
            )));
        }
        let now = Utc::now();
        Ok(User {
            id: new_id(),
            tg_user_id,
            display_name: display_name.into(),
            registration_status: RegistrationStatus::Pending,
            is_admin: false,
            privacy: PrivacySettings::default(),
            registered_at: now,
            last_active_at: now,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registration_status == RegistrationStatus::Completed
    }
}

// ── Plans ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    pub duration_days: i64,
    /// Consumable balance granted on activation, in micro-IRR.
    pub credit_micros: i64,
    /// Purchase price in IRR.
    pub price_irr: i64,
    /// Empty set means every model with active pricing is allowed.
    pub supported_models: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    pub fn new(
        name: impl Into<String>,
        duration_days: i64,
        credit_micros: i64,
        price_irr: i64,
        supported_models: Vec<String>,
    ) -> EngineResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArgument("plan name must not be empty".into()));
        }
        if duration_days <= 0 {
            return Err(EngineError::InvalidArgument("plan duration must be positive".into()));
        }
        if credit_micros < 0 {
            return Err(EngineError::InvalidArgument("plan credits must not be negative".into()));
        }
        if price_irr <= 0 {
            return Err(EngineError::InvalidArgument("plan price must be positive".into()));
        }
        Ok(SubscriptionPlan {
            id: new_id(),
            name,
            duration_days,
            credit_micros,
            price_irr,
            supported_models,
            created_at: Utc::now(),
        })
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.iter().any(|m| m == model)
    }

    pub fn duration(&self) -> Duration {
        Duration::days(self.duration_days)
    }
}

// ── Subscriptions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscription {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    /// Reserved rows: when the scheduler may promote this to active.
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Remaining consumable balance in micro-IRR.
    pub remaining_micros: i64,
}

impl UserSubscription {
    /// Active immediately: the purchase found no live subscription.
    pub fn new_active(user_id: &str, plan: &SubscriptionPlan, now: DateTime<Utc>) -> Self {
        UserSubscription {
            id: new_id(),
            user_id: user_id.to_string(),
            plan_id: plan.id.clone(),
            status: SubscriptionStatus::Active,
            created_at: now,
            scheduled_start_at: None,
            start_at: Some(now),
            expires_at: Some(now + plan.duration()),
            remaining_micros: plan.credit_micros,
        }
    }

    /// Reserved: activation deferred until the current active one ends.
    pub fn new_reserved(
        user_id: &str,
        plan: &SubscriptionPlan,
        scheduled_start_at: DateTime<Utc>,
    ) -> Self {
        UserSubscription {
            id: new_id(),
            user_id: user_id.to_string(),
            plan_id: plan.id.clone(),
            status: SubscriptionStatus::Reserved,
            created_at: Utc::now(),
            scheduled_start_at: Some(scheduled_start_at),
            start_at: None,
            expires_at: None,
            remaining_micros: plan.credit_micros,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|t| (t - now).num_days())
    }
}

// ── Payments & purchases ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub provider: String,
    /// Amount in IRR, copied from the plan at creation time.
    pub amount_irr: i64,
    pub currency: String,
    /// Gateway payment-intent token; unique per provider once assigned.
    pub authority: Option<String>,
    /// Gateway settlement reference; present iff succeeded.
    pub ref_id: Option<String>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub callback_url: String,
    pub description: String,
    pub metadata: serde_json::Value,
    /// Set once a subscription was granted for this payment.
    pub subscription_id: Option<String>,
    pub activation_code: Option<String>,
    pub activation_expires_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new_initiated(
        user_id: &str,
        plan: &SubscriptionPlan,
        provider: impl Into<String>,
        callback_url: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Payment {
            id: new_id(),
            user_id: user_id.to_string(),
            plan_id: plan.id.clone(),
            provider: provider.into(),
            amount_irr: plan.price_irr,
            currency: "IRR".into(),
            authority: None,
            ref_id: None,
            status: PaymentStatus::Initiated,
            created_at: now,
            updated_at: now,
            paid_at: None,
            callback_url: callback_url.into(),
            description: description.into(),
            metadata: serde_json::Value::Object(Default::default()),
            subscription_id: None,
            activation_code: None,
            activation_expires_at: None,
        }
    }
}

/// Immutable receipt row linking a succeeded payment to the subscription
/// it granted. UNIQUE on payment_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub payment_id: String,
    pub subscription_id: String,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    pub fn new(user_id: &str, plan_id: &str, payment_id: &str, subscription_id: &str) -> Self {
        Purchase {
            id: new_id(),
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            payment_id: payment_id.to_string(),
            subscription_id: subscription_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

// ── Activation codes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationCode {
    pub id: String,
    pub code: String,
    pub plan_id: String,
    pub is_redeemed: bool,
    pub redeemed_by_user_id: Option<String>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ActivationCode {
    pub fn new(plan_id: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        // 16 hex chars from a fresh UUID is unguessable enough for a
        // single-use code and short enough to type on a phone.
        let code = uuid::Uuid::new_v4().simple().to_string()[..16].to_uppercase();
        ActivationCode {
            id: new_id(),
            code,
            plan_id: plan_id.to_string(),
            is_redeemed: false,
            redeemed_by_user_id: None,
            redeemed_at: None,
            expires_at,
            created_at: Utc::now(),
        }
    }
}

// ── Chat sessions & messages ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub model: String,
    pub status: ChatSessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: &str, model: &str) -> Self {
        let now = Utc::now();
        ChatSession {
            id: new_id(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            status: ChatSessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: ChatRole,
    /// Plaintext, or base64 AES-GCM ciphertext iff `encrypted`.
    pub content: String,
    pub tokens: i64,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: &str, role: ChatRole, content: String, tokens: i64, encrypted: bool) -> Self {
        ChatMessage {
            id: new_id(),
            session_id: session_id.to_string(),
            role,
            content,
            tokens,
            encrypted,
            created_at: Utc::now(),
        }
    }
}

// ── AI jobs ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiJob {
    pub id: String,
    pub status: AiJobStatus,
    pub session_id: String,
    /// Stored user message, when storage is allowed.
    pub user_message_id: Option<String>,
    /// Carried-through turn text, when storage is opted out.
    pub payload_text: Option<String>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AiJob {
    pub fn new(session_id: &str, user_message_id: Option<String>, payload_text: Option<String>) -> Self {
        let now = Utc::now();
        AiJob {
            id: new_id(),
            status: AiJobStatus::Pending,
            session_id: session_id.to_string(),
            user_message_id,
            payload_text,
            retries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Model pricing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub id: String,
    pub model_name: String,
    /// Micro-IRR per prompt token.
    pub input_micros_per_token: i64,
    /// Micro-IRR per completion token.
    pub output_micros_per_token: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ModelPricing {
    pub fn new(model_name: &str, input_micros: i64, output_micros: i64) -> EngineResult<Self> {
        if model_name.trim().is_empty() {
            return Err(EngineError::InvalidArgument("model name must not be empty".into()));
        }
        if input_micros < 0 || output_micros < 0 {
            return Err(EngineError::InvalidArgument("token prices must not be negative".into()));
        }
        Ok(ModelPricing {
            id: new_id(),
            model_name: model_name.to_string(),
            input_micros_per_token: input_micros,
            output_micros_per_token: output_micros,
            active: true,
            created_at: Utc::now(),
        })
    }

    /// Cost of the prompt alone, used by the worker's pre-check.
    pub fn prompt_cost_micros(&self, prompt_tokens: i64) -> i64 {
        prompt_tokens * self.input_micros_per_token
    }

    /// Exact turn cost from provider-reported usage.
    pub fn turn_cost_micros(&self, usage: &TokenUsage) -> i64 {
        usage.prompt_tokens * self.input_micros_per_token
            + usage.completion_tokens * self.output_micros_per_token
    }
}

// ── LLM port data ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub description: String,
    pub max_tokens: u32,
    pub supports: Vec<String>,
}

/// One prompt message as sent to a provider. Always plaintext; decryption
/// happens before the window is assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        PromptMessage { role, content: content.into() }
    }
}

// ── Messenger port data ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Telegram chat id (equals the user id for DMs).
    pub chat_id: i64,
    pub text: String,
    pub parse_mode: Option<String>,
    /// Telegram reply-markup JSON (inline keyboards).
    pub reply_markup: Option<serde_json::Value>,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        OutboundMessage { chat_id, text: text.into(), parse_mode: None, reply_markup: None }
    }

    pub fn markdown(chat_id: i64, text: impl Into<String>) -> Self {
        OutboundMessage {
            chat_id,
            text: text.into(),
            parse_mode: Some("Markdown".into()),
            reply_markup: None,
        }
    }

    pub fn with_markup(mut self, markup: serde_json::Value) -> Self {
        self.reply_markup = Some(markup);
        self
    }
}

// ── Payment gateway port data ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefundMethod {
    Paya,
    Card,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub id: String,
    pub status: String,
    pub refund_amount: i64,
    pub refund_time: String,
}

// ── Conversation wizard state (cache-resident) ─────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub step: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

// ── Aggregate stats ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_users: i64,
    pub registered_users: i64,
    pub active_subscriptions: i64,
    pub succeeded_payments: i64,
    pub revenue_irr: i64,
    pub jobs_completed: i64,
    pub messages_stored: i64,
}
