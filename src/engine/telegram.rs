// ── Chatvend Engine: Telegram Bridge ───────────────────────────────────────
// Talks to the Bot API directly over long-polling (getUpdates). No public
// URL, no webhook middleman: the service pulls updates, routes commands
// to the use-cases, and pushes replies back out.
//
// The bridge is also the crate's `Messenger` implementation, so the
// worker, the payment service and the scheduler all deliver through the
// same send path (chunking + Markdown fallback).

use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::atoms::constants::{
    RATE_LIMIT_CALLBACKS_PER_MIN, RATE_LIMIT_COMMANDS_PER_MIN, RATE_LIMIT_WINDOW_SECS,
    TG_CHUNK_CHARS, TG_POLL_TIMEOUT_SECS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ConversationState, OutboundMessage, User};
use crate::engine::http::reconnect_delay;
use crate::engine::messenger::Messenger;
use crate::engine::metrics::Metrics;
use crate::engine::state::EngineState;
use crate::engine::usecase::payment::expires_in_days;

// ── Telegram API types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    is_bot: bool,
    first_name: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    message: Option<TgMessage>,
    data: Option<String>,
}

const TG_API: &str = "https://api.telegram.org/bot";

// ── Bridge ─────────────────────────────────────────────────────────────────

pub struct TelegramBridge {
    client: reqwest::Client,
    token: String,
}

impl TelegramBridge {
    pub fn new(token: impl Into<String>) -> Self {
        TelegramBridge {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(TG_POLL_TIMEOUT_SECS + 90))
                .build()
                .unwrap_or_default(),
            token: token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}{}/{}", TG_API, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
    ) -> EngineResult<T> {
        let resp: TgResponse<T> =
            self.client.post(self.url(method)).json(body).send().await?.json().await?;
        if !resp.ok {
            return Err(EngineError::Other(format!(
                "{} failed: {}",
                method,
                resp.description.unwrap_or_default()
            )));
        }
        resp.result.ok_or_else(|| EngineError::Other(format!("{}: empty result", method)))
    }

    async fn get_me(&self) -> EngineResult<String> {
        let me: Value = self.call("getMe", &json!({})).await?;
        Ok(me["username"].as_str().unwrap_or("unknown").to_string())
    }

    async fn get_updates(&self, offset: i64) -> EngineResult<Vec<TgUpdate>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": TG_POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    async fn answer_callback(&self, callback_id: &str) {
        let _: Result<Value, _> =
            self.call("answerCallbackQuery", &json!({"callback_query_id": callback_id})).await;
    }

    async fn send_typing(&self, chat_id: i64) {
        let _: Result<bool, _> = self
            .call("sendChatAction", &json!({"chat_id": chat_id, "action": "typing"}))
            .await;
    }

    /// Split on char boundaries below the Telegram hard limit.
    fn split_text(text: &str, max_chars: usize) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut count = 0usize;
        for ch in text.chars() {
            if count >= max_chars {
                chunks.push(std::mem::take(&mut current));
                count = 0;
            }
            current.push(ch);
            count += 1;
        }
        if !current.is_empty() || chunks.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

#[async_trait::async_trait]
impl Messenger for TelegramBridge {
    async fn send_message(&self, message: OutboundMessage) -> EngineResult<()> {
        let chunks = Self::split_text(&message.text, TG_CHUNK_CHARS);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = json!({"chat_id": message.chat_id, "text": chunk});
            if let Some(mode) = &message.parse_mode {
                body["parse_mode"] = json!(mode);
            }
            // Keyboards only make sense on the final chunk.
            if i == last {
                if let Some(markup) = &message.reply_markup {
                    body["reply_markup"] = markup.clone();
                }
            }
            let sent: EngineResult<Value> = self.call("sendMessage", &body).await;
            if sent.is_err() && message.parse_mode.is_some() {
                // Model output regularly breaks Telegram's Markdown
                // parser; retry the chunk as plain text.
                let mut plain = json!({"chat_id": message.chat_id, "text": chunk});
                if i == last {
                    if let Some(markup) = &message.reply_markup {
                        plain["reply_markup"] = markup.clone();
                    }
                }
                let _: Value = self.call("sendMessage", &plain).await?;
            } else {
                sent?;
            }
        }
        Ok(())
    }

    async fn set_menu_commands(&self, chat_id: i64, is_admin: bool) -> EngineResult<()> {
        let mut commands = vec![
            json!({"command": "start", "description": "Register and accept the policy"}),
            json!({"command": "plans", "description": "Browse subscription plans"}),
            json!({"command": "status", "description": "Subscription and credit balance"}),
            json!({"command": "chat", "description": "Start a chat session"}),
            json!({"command": "end", "description": "End the current chat"}),
            json!({"command": "models", "description": "Models your plan allows"}),
            json!({"command": "history", "description": "Past chat sessions"}),
            json!({"command": "privacy", "description": "Storage and encryption settings"}),
            json!({"command": "redeem", "description": "Redeem an activation code"}),
            json!({"command": "help", "description": "How this bot works"}),
        ];
        if is_admin {
            commands.extend([
                json!({"command": "newplan", "description": "Create a plan"}),
                json!({"command": "delplan", "description": "Delete a plan"}),
                json!({"command": "setprice", "description": "Upsert model pricing"}),
                json!({"command": "gencode", "description": "Issue an activation code"}),
                json!({"command": "attachcode", "description": "Attach a code to a payment"}),
                json!({"command": "stats", "description": "Service statistics"}),
            ]);
        }
        let _: bool = self
            .call(
                "setMyCommands",
                &json!({
                    "commands": commands,
                    "scope": {"type": "chat", "chat_id": chat_id},
                }),
            )
            .await?;
        Ok(())
    }
}

// ── Polling loop ───────────────────────────────────────────────────────────

/// Start the long-polling loop. Returns the task handle; flipping `stop`
/// lets the current poll finish and exits.
pub fn spawn_polling(state: Arc<EngineState>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reconnect_attempt = 0u32;
        while !stop.load(Ordering::Relaxed) {
            match run_polling(&state, &stop).await {
                Ok(()) => break,
                Err(e) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let delay = reconnect_delay(reconnect_attempt).await;
                    warn!(
                        "[telegram] Bridge error: {}; reconnecting after {}ms (attempt {})",
                        e,
                        delay.as_millis(),
                        reconnect_attempt + 1
                    );
                    reconnect_attempt += 1;
                }
            }
        }
        info!("[telegram] Bridge stopped");
    })
}

async fn run_polling(state: &Arc<EngineState>, stop: &AtomicBool) -> EngineResult<()> {
    let bridge = &state.telegram;
    let username = bridge.get_me().await?;
    info!("[telegram] Connected as @{}", username);

    // Bounded worker pool for inbound updates.
    let pool = Arc::new(Semaphore::new(state.config.bot.workers));
    static OFFSET: AtomicI64 = AtomicI64::new(0);

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let updates = bridge.get_updates(OFFSET.load(Ordering::Relaxed)).await?;
        for update in updates {
            OFFSET.store(update.update_id + 1, Ordering::Relaxed);
            Metrics::incr(&state.metrics.updates_received);
            let permit = pool.clone().acquire_owned().await.map_err(|_| {
                EngineError::OperationFailed("update pool closed".into())
            })?;
            let state = state.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Some(msg) = update.message {
                    handle_message(&state, msg).await;
                } else if let Some(cq) = update.callback_query {
                    handle_callback(&state, cq).await;
                }
            });
        }
    }
}

// ── Inbound message handling ───────────────────────────────────────────────

async fn handle_message(state: &Arc<EngineState>, msg: TgMessage) {
    let Some(from) = &msg.from else { return };
    if from.is_bot {
        return;
    }
    let Some(text) = msg.text.as_deref().filter(|t| !t.is_empty()) else { return };
    let chat_id = msg.chat.id;

    let rl_key = format!("rl:cmd:{}", from.id);
    if !state
        .ratelimit
        .allow(&rl_key, RATE_LIMIT_COMMANDS_PER_MIN, Duration::from_secs(RATE_LIMIT_WINDOW_SECS))
        .await
    {
        Metrics::incr(&state.metrics.rate_limited);
        debug!("[telegram] Rate-limited {}", from.id);
        return;
    }

    let user = match ensure_user(state, from).await {
        Ok(user) => user,
        Err(e) => {
            error!("[telegram] User bootstrap for {} failed: {}", from.id, e);
            reply(state, chat_id, "⚠️ Something went wrong. Please try again.").await;
            return;
        }
    };

    debug!("[telegram] {} ({}): {}", from.first_name, from.id, text);

    // Wizard steps eat the next plain message.
    if !text.starts_with('/') {
        if let Ok(Some(conv)) = state.convstate.get(from.id).await {
            handle_wizard_step(state, &user, chat_id, conv, text).await;
            return;
        }
    }

    if text.starts_with('/') {
        handle_command(state, &user, chat_id, text).await;
    } else {
        handle_chat_turn(state, &user, chat_id, text).await;
    }
}

async fn ensure_user(state: &Arc<EngineState>, from: &TgUser) -> EngineResult<User> {
    if let Some(mut user) = state.users.find_by_tg_id(from.id).await? {
        let is_admin = state.config.bot.admin_ids.contains(&from.id);
        if user.is_admin != is_admin {
            user.is_admin = is_admin;
            state.users.update(&user).await?;
        }
        return Ok(user);
    }
    let display_name = from.username.clone().unwrap_or_else(|| from.first_name.clone());
    let mut user = User::new(from.id, display_name)?;
    user.is_admin = state.config.bot.admin_ids.contains(&from.id);
    state.users.insert(&user).await?;
    info!("[telegram] New user {} ({})", user.display_name, from.id);
    if let Err(e) = state.telegram.set_menu_commands(from.id, user.is_admin).await {
        warn!("[telegram] setMyCommands for {} failed: {}", from.id, e);
    }
    Ok(user)
}

async fn handle_command(state: &Arc<EngineState>, user: &User, chat_id: i64, text: &str) {
    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("");
    let command = command.split('@').next().unwrap_or(command);
    let args = parts.next().unwrap_or("").trim();

    // Everything except /start and /help requires a completed
    // registration (policy accepted).
    if !user.is_registered() && !matches!(command, "/start" | "/help") {
        send_policy_prompt(state, chat_id).await;
        return;
    }

    match command {
        "/start" => cmd_start(state, user, chat_id).await,
        "/help" => reply(state, chat_id, HELP_TEXT).await,
        "/plans" => cmd_plans(state, chat_id).await,
        "/status" => cmd_status(state, user, chat_id).await,
        "/models" => cmd_models(state, user, chat_id).await,
        "/chat" => cmd_chat(state, user, chat_id, args).await,
        "/end" => cmd_end(state, user, chat_id).await,
        "/history" => cmd_history(state, user, chat_id).await,
        "/privacy" => send_privacy_menu(state, user, chat_id).await,
        "/redeem" => cmd_redeem(state, user, chat_id, args).await,
        "/newplan" if user.is_admin => cmd_newplan(state, chat_id, args).await,
        "/delplan" if user.is_admin => cmd_delplan(state, chat_id, args).await,
        "/setprice" if user.is_admin => cmd_setprice(state, chat_id, args).await,
        "/gencode" if user.is_admin => cmd_gencode(state, chat_id, args).await,
        "/attachcode" if user.is_admin => cmd_attachcode(state, chat_id, args).await,
        "/stats" if user.is_admin => cmd_stats(state, chat_id).await,
        _ => reply(state, chat_id, "Unknown command. Try /help.").await,
    }
}

async fn handle_chat_turn(state: &Arc<EngineState>, user: &User, chat_id: i64, text: &str) {
    if !user.is_registered() {
        send_policy_prompt(state, chat_id).await;
        return;
    }
    state.telegram.send_typing(chat_id).await;
    match state.chat.send_message(user, text).await {
        // The job is queued; the reply arrives asynchronously from the
        // worker through the same Messenger.
        Ok(_) => {}
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn handle_wizard_step(
    state: &Arc<EngineState>,
    user: &User,
    chat_id: i64,
    conv: ConversationState,
    text: &str,
) {
    let _ = state.convstate.clear(user.tg_user_id).await;
    match conv.step.as_str() {
        "awaiting_code" => match state.payments.redeem_activation_code(user, text.trim()).await {
            Ok(_) => reply(state, chat_id, "🎉 Code accepted!").await,
            Err(EngineError::NotFound(_)) => {
                reply(state, chat_id, "❌ That code is unknown, expired or already used.").await
            }
            Err(e) => reply(state, chat_id, &user_facing(&e)).await,
        },
        "awaiting_retention" => match text.trim().parse::<u32>() {
            Ok(days) if days > 0 => match state.privacy.set_retention_days(user, days).await {
                Ok(_) => {
                    reply(state, chat_id, &format!("🗓 Retention set to {} days.", days)).await
                }
                Err(e) => reply(state, chat_id, &user_facing(&e)).await,
            },
            _ => reply(state, chat_id, "Please send a whole number of days, e.g. 30.").await,
        },
        other => {
            warn!("[telegram] Unknown wizard step {:?}", other);
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────────────

const HELP_TEXT: &str = "This bot sells metered access to AI chat.\n\n\
/plans — browse and buy a subscription\n\
/redeem — activate a code instead of paying\n\
/chat — start a session, then just type to talk\n\
/end — close the session\n\
/status — credits and expiry\n\
/models — models your plan allows\n\
/history — revisit or clean up old sessions\n\
/privacy — storage and encryption controls";

async fn cmd_start(state: &Arc<EngineState>, user: &User, chat_id: i64) {
    if user.is_registered() {
        reply(state, chat_id, "You're all set. /plans to browse subscriptions, /chat to talk.")
            .await;
        return;
    }
    send_policy_prompt(state, chat_id).await;
}

async fn send_policy_prompt(state: &Arc<EngineState>, chat_id: i64) {
    let markup = json!({
        "inline_keyboard": [[{"text": "✅ I accept", "callback_data": "policy:accept"}]]
    });
    send(
        state,
        OutboundMessage::text(
            chat_id,
            "Welcome! 👋 Before we start: your messages are processed by third-party AI \
             providers, and stored according to your /privacy settings. Accept to continue.",
        )
        .with_markup(markup),
    )
    .await;
}

async fn cmd_plans(state: &Arc<EngineState>, chat_id: i64) {
    let plans = match state.plans.list_all().await {
        Ok(plans) => plans,
        Err(e) => return reply(state, chat_id, &user_facing(&e)).await,
    };
    if plans.is_empty() {
        return reply(state, chat_id, "No plans are on sale right now.").await;
    }
    let mut lines = vec!["*Available plans*".to_string()];
    let mut keyboard = Vec::new();
    for plan in &plans {
        lines.push(format!(
            "• *{}* — {} days, {} credits, {} IRR",
            plan.name,
            plan.duration_days,
            plan.credit_micros / 1_000_000,
            plan.price_irr
        ));
        keyboard.push(vec![json!({
            "text": format!("Buy {} ({} IRR)", plan.name, plan.price_irr),
            "callback_data": format!("buy:{}", plan.id),
        })]);
    }
    send(
        state,
        OutboundMessage::markdown(chat_id, lines.join("\n"))
            .with_markup(json!({"inline_keyboard": keyboard})),
    )
    .await;
}

async fn cmd_status(state: &Arc<EngineState>, user: &User, chat_id: i64) {
    let active = state.subscriptions.get_active(&user.id);
    let reserved = state.subscriptions.get_reserved(&user.id);
    let mut lines = Vec::new();
    match active {
        Ok(Some(sub)) => {
            lines.push(format!(
                "💳 Active subscription: {} credits left",
                sub.remaining_micros / 1_000_000
            ));
            if let Some(expires) = sub.expires_at {
                lines.push(format!("⏳ Expires {}", expires.format("%Y-%m-%d %H:%M UTC")));
            }
        }
        Ok(None) => lines.push("No active subscription. /plans to get one.".into()),
        Err(e) => lines.push(user_facing(&e)),
    }
    if let Ok(reserved) = reserved {
        for sub in reserved {
            if let Some(start) = sub.scheduled_start_at {
                lines.push(format!("📦 Reserved plan starts {}", start.format("%Y-%m-%d")));
            }
        }
    }
    reply(state, chat_id, &lines.join("\n")).await;
}

async fn cmd_models(state: &Arc<EngineState>, user: &User, chat_id: i64) {
    match state.chat.list_models(user).await {
        Ok(models) if models.is_empty() => {
            reply(state, chat_id, "No models are enabled for your plan yet.").await
        }
        Ok(models) => {
            let lines: Vec<String> = models
                .iter()
                .map(|m| match state.llm.model_info(m) {
                    Some(info) => format!("• {} (context {}k)", m, info.max_tokens / 1_000),
                    None => format!("• {}", m),
                })
                .collect();
            reply(state, chat_id, &format!("Models you can use:\n{}", lines.join("\n"))).await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_chat(state: &Arc<EngineState>, user: &User, chat_id: i64, args: &str) {
    if args.is_empty() {
        // Offer the allowed models as buttons.
        let models = match state.chat.list_models(user).await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => return reply(state, chat_id, "No models available on your plan.").await,
            Err(e) => return reply(state, chat_id, &user_facing(&e)).await,
        };
        let keyboard: Vec<Vec<Value>> = models
            .iter()
            .map(|m| vec![json!({"text": m, "callback_data": format!("model:{}", m)})])
            .collect();
        send(
            state,
            OutboundMessage::text(chat_id, "Pick a model:")
                .with_markup(json!({"inline_keyboard": keyboard})),
        )
        .await;
        return;
    }
    start_chat_and_report(state, user, chat_id, args).await;
}

async fn start_chat_and_report(state: &Arc<EngineState>, user: &User, chat_id: i64, model: &str) {
    match state.chat.start_chat(user, model).await {
        Ok(session) => {
            reply(
                state,
                chat_id,
                &format!("💬 Chat started on {}. Just type to talk; /end when done.", session.model),
            )
            .await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_end(state: &Arc<EngineState>, user: &User, chat_id: i64) {
    match state.chat.end_chat(user) {
        Ok(_) => reply(state, chat_id, "Chat ended. /history to revisit it later.").await,
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_history(state: &Arc<EngineState>, user: &User, chat_id: i64) {
    let sessions = match state.chat.list_history(user) {
        Ok(s) => s,
        Err(e) => return reply(state, chat_id, &user_facing(&e)).await,
    };
    if sessions.is_empty() {
        return reply(state, chat_id, "No sessions yet. /chat to start one.").await;
    }
    let mut keyboard = Vec::new();
    let mut lines = vec!["*Your sessions*".to_string()];
    for session in sessions.iter().take(10) {
        lines.push(format!(
            "• {} — {} ({})",
            session.updated_at.format("%m-%d %H:%M"),
            session.model,
            session.status
        ));
        keyboard.push(vec![
            json!({"text": format!("▶ {}", session.model), "callback_data": format!("hist:{}", session.id)}),
            json!({"text": "🗑", "callback_data": format!("del:{}", session.id)}),
        ]);
    }
    send(
        state,
        OutboundMessage::markdown(chat_id, lines.join("\n"))
            .with_markup(json!({"inline_keyboard": keyboard})),
    )
    .await;
}

async fn send_privacy_menu(state: &Arc<EngineState>, user: &User, chat_id: i64) {
    let p = &user.privacy;
    let flag = |on: bool| if on { "on" } else { "off" };
    let markup = json!({"inline_keyboard": [
        [{"text": format!("Message storage: {}", flag(p.allow_message_storage)),
          "callback_data": "privacy:storage"}],
        [{"text": format!("Encrypt stored messages: {}", flag(p.data_encrypted)),
          "callback_data": "privacy:encrypt"}],
        [{"text": format!("Auto-delete after {} days: {}", p.retention_days, flag(p.auto_delete)),
          "callback_data": "privacy:autodel"}],
        [{"text": "Change retention days", "callback_data": "privacy:retention"}],
    ]});
    send(
        state,
        OutboundMessage::text(chat_id, "Privacy settings — tap to toggle:").with_markup(markup),
    )
    .await;
}

async fn cmd_redeem(state: &Arc<EngineState>, user: &User, chat_id: i64, args: &str) {
    if args.is_empty() {
        let conv = ConversationState { step: "awaiting_code".into(), ..Default::default() };
        if state.convstate.set(user.tg_user_id, &conv).await.is_ok() {
            reply(state, chat_id, "Send me the activation code:").await;
        } else {
            reply(state, chat_id, "⚠️ Could not start the redeem flow, try /redeem CODE.").await;
        }
        return;
    }
    match state.payments.redeem_activation_code(user, args).await {
        Ok(_) => reply(state, chat_id, "🎉 Code accepted!").await,
        Err(EngineError::NotFound(_)) => {
            reply(state, chat_id, "❌ That code is unknown, expired or already used.").await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

// ── Admin commands ─────────────────────────────────────────────────────────

async fn cmd_newplan(state: &Arc<EngineState>, chat_id: i64, args: &str) {
    // name|days|credit_micros|price_irr[|model1,model2]
    let fields: Vec<&str> = args.split('|').map(str::trim).collect();
    if fields.len() < 4 {
        return reply(
            state,
            chat_id,
            "Usage: /newplan name|days|credit_micros|price_irr[|model1,model2]",
        )
        .await;
    }
    let parsed = (
        fields[1].parse::<i64>(),
        fields[2].parse::<i64>(),
        fields[3].parse::<i64>(),
    );
    let (Ok(days), Ok(credits), Ok(price)) = parsed else {
        return reply(state, chat_id, "Days, credits and price must be integers.").await;
    };
    let models = fields
        .get(4)
        .map(|s| s.split(',').map(|m| m.trim().to_string()).filter(|m| !m.is_empty()).collect())
        .unwrap_or_default();
    match crate::atoms::types::SubscriptionPlan::new(fields[0], days, credits, price, models) {
        Ok(plan) => match state.plans.insert(&plan).await {
            Ok(()) => {
                reply(state, chat_id, &format!("Plan *{}* created ({}).", plan.name, plan.id))
                    .await
            }
            Err(e) => reply(state, chat_id, &user_facing(&e)).await,
        },
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_delplan(state: &Arc<EngineState>, chat_id: i64, args: &str) {
    if args.is_empty() {
        return reply(state, chat_id, "Usage: /delplan <plan-id>").await;
    }
    match state.subscriptions.delete_plan(args).await {
        Ok(()) => reply(state, chat_id, "Plan deleted.").await,
        Err(EngineError::SubscriptionWithActiveUser) => {
            reply(state, chat_id, "❌ Plan has active or reserved subscribers.").await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_setprice(state: &Arc<EngineState>, chat_id: i64, args: &str) {
    // Bare /setprice: show what the providers actually serve, to price
    // against real model names.
    if args.is_empty() {
        return match state.llm.list_models().await {
            Ok(models) if !models.is_empty() => {
                reply(
                    state,
                    chat_id,
                    &format!(
                        "Usage: /setprice model|input_micros|output_micros\nUpstream models:\n• {}",
                        models.join("\n• ")
                    ),
                )
                .await
            }
            Ok(_) => reply(state, chat_id, "Usage: /setprice model|input_micros|output_micros").await,
            Err(e) => reply(state, chat_id, &user_facing(&e)).await,
        };
    }
    // model|input_micros|output_micros
    let fields: Vec<&str> = args.split('|').map(str::trim).collect();
    if fields.len() != 3 {
        return reply(state, chat_id, "Usage: /setprice model|input_micros|output_micros").await;
    }
    let (Ok(input), Ok(output)) = (fields[1].parse::<i64>(), fields[2].parse::<i64>()) else {
        return reply(state, chat_id, "Prices must be integers (micro-IRR per token).").await;
    };
    match crate::atoms::types::ModelPricing::new(fields[0], input, output) {
        Ok(pricing) => match state.pricing.upsert(&pricing).await {
            Ok(()) => {
                reply(
                    state,
                    chat_id,
                    &format!("Pricing set: {} at {}/{} micros per token.", fields[0], input, output),
                )
                .await
            }
            Err(e) => reply(state, chat_id, &user_facing(&e)).await,
        },
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_gencode(state: &Arc<EngineState>, chat_id: i64, args: &str) {
    // <plan-id> [valid-days]
    let mut parts = args.split_whitespace();
    let Some(plan_id) = parts.next() else {
        return reply(state, chat_id, "Usage: /gencode <plan-id> [valid-days]").await;
    };
    let expires_at = parts.next().and_then(|d| d.parse::<i64>().ok()).map(expires_in_days);
    match state.payments.issue_activation_code(plan_id, expires_at).await {
        Ok(code) => {
            reply(state, chat_id, &format!("Activation code: `{}`", code.code)).await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_attachcode(state: &Arc<EngineState>, chat_id: i64, args: &str) {
    // <payment-id> [valid-days] — for manually arranged payments.
    let mut parts = args.split_whitespace();
    let Some(payment_id) = parts.next() else {
        return reply(state, chat_id, "Usage: /attachcode <payment-id> [valid-days]").await;
    };
    let expires_at = parts.next().and_then(|d| d.parse::<i64>().ok()).map(expires_in_days);
    match state.payments.issue_code_for_payment(payment_id, expires_at).await {
        Ok(code) => {
            reply(state, chat_id, &format!("Code attached to the payment: `{}`", code.code)).await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cmd_stats(state: &Arc<EngineState>, chat_id: i64) {
    match state.stats.summary() {
        Ok(s) => {
            reply(
                state,
                chat_id,
                &format!(
                    "👥 Users: {} ({} registered)\n📜 Active subscriptions: {}\n💰 Payments: {} succeeded, {} IRR\n🤖 Jobs completed: {}\n💬 Messages stored: {}",
                    s.total_users,
                    s.registered_users,
                    s.active_subscriptions,
                    s.succeeded_payments,
                    s.revenue_irr,
                    s.jobs_completed,
                    s.messages_stored
                ),
            )
            .await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

// ── Callback queries (inline keyboard taps) ────────────────────────────────

async fn handle_callback(state: &Arc<EngineState>, cq: TgCallbackQuery) {
    state.telegram.answer_callback(&cq.id).await;
    let Some(data) = cq.data.as_deref() else { return };
    let chat_id = cq.message.as_ref().map(|m| m.chat.id).unwrap_or(cq.from.id);

    let rl_key = format!("rl:cb:{}", cq.from.id);
    if !state
        .ratelimit
        .allow(&rl_key, RATE_LIMIT_CALLBACKS_PER_MIN, Duration::from_secs(RATE_LIMIT_WINDOW_SECS))
        .await
    {
        Metrics::incr(&state.metrics.rate_limited);
        return;
    }

    let user = match ensure_user(state, &cq.from).await {
        Ok(user) => user,
        Err(e) => {
            error!("[telegram] Callback user bootstrap failed: {}", e);
            return;
        }
    };

    let (action, arg) = data.split_once(':').unwrap_or((data, ""));
    match action {
        "policy" if arg == "accept" => {
            let mut user = user;
            user.registration_status = crate::atoms::types::RegistrationStatus::Completed;
            match state.users.update(&user).await {
                Ok(()) => {
                    reply(state, chat_id, "✅ Registered! /plans to pick a subscription.").await
                }
                Err(e) => reply(state, chat_id, &user_facing(&e)).await,
            }
        }
        "buy" => cb_buy(state, &user, chat_id, arg).await,
        "model" => start_chat_and_report(state, &user, chat_id, arg).await,
        "hist" => match state.chat.switch_active(&user, arg) {
            Ok(session) => {
                reply(state, chat_id, &format!("▶ Switched to your {} session.", session.model))
                    .await
            }
            Err(e) => reply(state, chat_id, &user_facing(&e)).await,
        },
        "del" => match state.chat.delete_session(&user, arg) {
            Ok(()) => reply(state, chat_id, "🗑 Session deleted.").await,
            Err(e) => reply(state, chat_id, &user_facing(&e)).await,
        },
        "privacy" => cb_privacy(state, &user, chat_id, arg).await,
        other => debug!("[telegram] Unknown callback {:?}", other),
    }
}

async fn cb_buy(state: &Arc<EngineState>, user: &User, chat_id: i64, plan_id: &str) {
    if !user.is_registered() {
        send_policy_prompt(state, chat_id).await;
        return;
    }
    match state.payments.request_payment(user, plan_id).await {
        Ok((_payment, pay_url)) => {
            let markup = json!({
                "inline_keyboard": [[{"text": "💳 Pay now", "url": pay_url}]]
            });
            send(
                state,
                OutboundMessage::text(
                    chat_id,
                    "Follow the button to pay. I'll confirm here the moment the gateway does.",
                )
                .with_markup(markup),
            )
            .await;
        }
        Err(EngineError::AlreadyHasReserved) => {
            reply(state, chat_id, "You already have a reserved subscription for another plan.")
                .await
        }
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

async fn cb_privacy(state: &Arc<EngineState>, user: &User, chat_id: i64, toggle: &str) {
    let result = match toggle {
        "storage" => state.privacy.toggle_storage(user).await,
        "encrypt" => state.privacy.toggle_encryption(user).await,
        "autodel" => state.privacy.toggle_auto_delete(user).await,
        "retention" => {
            let conv = ConversationState { step: "awaiting_retention".into(), ..Default::default() };
            let _ = state.convstate.set(user.tg_user_id, &conv).await;
            reply(state, chat_id, "How many days should messages be kept?").await;
            return;
        }
        _ => return,
    };
    match result {
        Ok(updated) => send_privacy_menu(state, &updated, chat_id).await,
        Err(e) => reply(state, chat_id, &user_facing(&e)).await,
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

async fn reply(state: &Arc<EngineState>, chat_id: i64, text: &str) {
    send(state, OutboundMessage::markdown(chat_id, text)).await;
}

async fn send(state: &Arc<EngineState>, message: OutboundMessage) {
    if let Err(e) = state.telegram.send_message(message).await {
        warn!("[telegram] send failed: {}", e);
    }
}

/// Map taxonomy errors onto something a chat user can act on.
fn user_facing(e: &EngineError) -> String {
    match e {
        EngineError::NotFound("user") => "You're not registered yet. Send /start first.".into(),
        EngineError::NotFound("plan") => "No such plan.".into(),
        EngineError::NotFound("chat session") => {
            "No chat here yet. Start one with /chat.".into()
        }
        EngineError::NotFound(what) => format!("No such {}.", what),
        EngineError::ActiveChatExists => {
            "You already have an open chat. /end it before starting another.".into()
        }
        EngineError::AlreadyHasReserved => {
            "You already have a reserved subscription for another plan.".into()
        }
        EngineError::NoActiveSubscription | EngineError::ExpiredSubscription => {
            "You need an active subscription. Browse /plans or /redeem a code.".into()
        }
        EngineError::InsufficientBalance { .. } => {
            "Not enough credits left. Top up via /plans.".into()
        }
        EngineError::ModelNotAvailable(model) => {
            format!("Model {} is not available on your plan. See /models.", model)
        }
        EngineError::InvalidArgument(msg) => format!("That doesn't look right: {}", msg),
        EngineError::OperationFailed(_) => "Busy with your previous request, try again in a moment.".into(),
        _ => "⚠️ Something went wrong. Please try again.".into(),
    }
}
