use std::time::Duration;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, KeyboardButton,
    KeyboardMarkup, ParseMode,
};
use tracing::{error, warn};
use url::Url;

use crate::billing;
use crate::billing::payment::{generate_payment_link, tariffs};
use crate::config::CONFIG;
use crate::llm::{self, ModelTier};
use crate::memory::{self, SHORT_MEMORY_WINDOW};
use crate::state::AppState;
use crate::utils::telegram::{escape_html, start_chat_action_heartbeat};

const BTN_HELP: &str = "❓ Помощь";
const BTN_SUBSCRIBE: &str = "💳 Подписка";
const BTN_SUBSCRIBE_ACTION: &str = "💳 Оформить подписку";
const BTN_NEW_DIALOG: &str = "🔄 Новый диалог";
const BTN_LIMIT: &str = "📊 Мой лимит";
const BTN_CREATE_IMAGE: &str = "🖼 Создать изображение";

const TEXT_ONLY_HINT: &str =
    "Я понимаю только текстовые сообщения. Пожалуйста, напиши текст.";
const QUOTA_EXCEEDED: &str = "Подожди немного… Ты исчерпал лимит на сегодня.\n\n\
Оформи подписку, чтобы продолжить общение без ограничений!";
const MODERATION_REFUSAL: &str = "Извини, но этот запрос нарушает правила безопасности. \
Пожалуйста, попробуй другой запрос без неприемлемого содержания.";
const GENERIC_APOLOGY: &str = "Извини, произошла ошибка. Попробуй еще раз через минуту.";

const THINKING_DELAY_BASE_SECS: f32 = 0.5;
const THINKING_DELAY_CAP_SECS: f32 = 1.5;
const THINKING_DELAY_CHARS_PER_SEC: f32 = 500.0;

/// Reply-keyboard button labels resolved into a closed set once at the
/// boundary, instead of matching display strings inside handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyboardAction {
    Help,
    Subscribe,
    NewDialog,
    Limit,
    CreateImage,
}

fn classify_button(text: &str) -> Option<KeyboardAction> {
    match text.trim() {
        BTN_HELP => Some(KeyboardAction::Help),
        BTN_SUBSCRIBE | BTN_SUBSCRIBE_ACTION => Some(KeyboardAction::Subscribe),
        BTN_NEW_DIALOG => Some(KeyboardAction::NewDialog),
        BTN_LIMIT => Some(KeyboardAction::Limit),
        BTN_CREATE_IMAGE => Some(KeyboardAction::CreateImage),
        _ => None,
    }
}

fn main_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new([
        vec![
            KeyboardButton::new(BTN_HELP),
            KeyboardButton::new(BTN_SUBSCRIBE),
        ],
        vec![
            KeyboardButton::new(BTN_NEW_DIALOG),
            KeyboardButton::new(BTN_LIMIT),
        ],
        vec![KeyboardButton::new(BTN_CREATE_IMAGE)],
    ])
    .resize_keyboard()
}

fn subscribe_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new([vec![KeyboardButton::new(BTN_SUBSCRIBE_ACTION)]]).resize_keyboard()
}

fn sender_id(message: &Message) -> Option<i64> {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
}

fn thinking_delay(text_chars: usize) -> Duration {
    let secs = (THINKING_DELAY_BASE_SECS + text_chars as f32 / THINKING_DELAY_CHARS_PER_SEC)
        .min(THINKING_DELAY_CAP_SECS);
    Duration::from_secs_f32(secs)
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = sender_id(&message) else {
        return Ok(());
    };

    let mut greeting = CONFIG.welcome_message.clone();
    if let Some(summary) = memory::latest_summary(&state.db, user_id).await? {
        greeting.push_str(&format!(
            "\n\n<b>Краткое резюме прошлой сессии:</b> {}",
            escape_html(&summary)
        ));
    }

    bot.send_message(message.chat.id, greeting)
        .parse_mode(ParseMode::Html)
        .reply_markup(main_keyboard())
        .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    let help_text = "🤖 <b>Что я умею:</b>\n\n\
✅ Отвечаю на вопросы и поддерживаю диалог\n\
✅ Помню контекст нашего разговора\n\
✅ Могу быть эмпатичным собеседником\n\
✅ Генерирую изображения по описанию (для подписчиков)\n\n\
<b>Команды:</b>\n\
/start - Начать диалог\n\
/help - Показать эту справку\n\
/subscribe - Оформить подписку\n\
/new - Начать новый диалог\n\
/limit - Проверить лимит сообщений\n\
/image - Сгенерировать изображение\n\n\
<b>Подписка даёт:</b>\n\
• Доступ к самой мощной модели\n\
• Неограниченное количество сообщений\n\
• Генерацию изображений по описанию\n\
• Приоритетную обработку запросов";

    bot.send_message(message.chat.id, help_text)
        .parse_mode(ParseMode::Html)
        .reply_markup(main_keyboard())
        .await?;
    Ok(())
}

pub async fn new_dialog_handler(bot: Bot, message: Message) -> Result<()> {
    // History stays in the store; only the conversational framing resets.
    bot.send_message(
        message.chat.id,
        "Начинаем новый диалог! О чём хочешь поговорить?",
    )
    .reply_markup(main_keyboard())
    .await?;
    Ok(())
}

pub async fn limit_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = sender_id(&message) else {
        return Ok(());
    };

    if billing::is_subscribed(&state.db, user_id).await? {
        bot.send_message(
            message.chat.id,
            "У тебя активна подписка! Ты можешь отправлять неограниченное количество сообщений 🎉",
        )
        .reply_markup(main_keyboard())
        .await?;
        return Ok(());
    }

    let (used, limit) = billing::get_usage(&state.db, user_id).await?;
    let remaining = (limit - used).max(0);
    bot.send_message(
        message.chat.id,
        format!(
            "📊 <b>Твой лимит на сегодня:</b>\n\n\
✅ Использовано: {used} из {limit}\n\
✅ Осталось: {remaining} сообщений\n\n\
Для снятия ограничений оформи подписку!"
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_markup(main_keyboard())
    .await?;
    Ok(())
}

pub async fn subscribe_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = sender_id(&message) else {
        return Ok(());
    };

    if billing::is_subscribed(&state.db, user_id).await? {
        bot.send_message(
            message.chat.id,
            "У тебя уже есть активная подписка! Наслаждайся общением без ограничений.",
        )
        .reply_markup(main_keyboard())
        .await?;
        return Ok(());
    }

    let mut rows = Vec::new();
    for tariff in tariffs() {
        let link = generate_payment_link(user_id, tariff);
        let url = Url::parse(&link)?;
        rows.push(vec![InlineKeyboardButton::url(tariff.label(), url)]);
    }

    bot.send_message(
        message.chat.id,
        "Выбери подписку для общения без ограничений:\n\n\
✅ Без лимита на количество сообщений\n\
✅ Доступ к самой мощной модели\n\
✅ Генерация изображений по описанию\n\
✅ Приоритетная обработка запросов\n\
✅ Долгосрочная память для более глубоких диалогов",
    )
    .reply_markup(InlineKeyboardMarkup::new(rows))
    .await?;
    Ok(())
}

pub async fn image_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = sender_id(&message) else {
        return Ok(());
    };

    if !billing::is_subscribed(&state.db, user_id).await? {
        bot.send_message(
            message.chat.id,
            "Генерация изображений доступна только для пользователей с подпиской.\n\
Оформи подписку, чтобы создавать изображения!",
        )
        .reply_markup(subscribe_keyboard())
        .await?;
        return Ok(());
    }

    state.expect_image_prompt(user_id);
    bot.send_message(
        message.chat.id,
        "Опиши изображение, которое хочешь создать. Будь максимально конкретным.\n\n\
Например: 'Космонавт на лошади в стиле акварели'",
    )
    .reply_markup(main_keyboard())
    .await?;
    Ok(())
}

/// Entry point for every non-command message: resolves keyboard buttons,
/// then routes to the image-prompt or plain-chat flow. Failures inside the
/// chat and image flows surface as one generic apology and never escape
/// to the dispatcher.
pub async fn handle_message(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = sender_id(&message) else {
        return Ok(());
    };
    let chat_id = message.chat.id;

    let Some(text) = message.text().map(|value| value.to_string()) else {
        bot.send_message(chat_id, TEXT_ONLY_HINT)
            .reply_markup(main_keyboard())
            .await?;
        return Ok(());
    };

    if let Some(action) = classify_button(&text) {
        return match action {
            KeyboardAction::Help => help_handler(bot, message).await,
            KeyboardAction::Subscribe => subscribe_handler(bot, state, message).await,
            KeyboardAction::NewDialog => new_dialog_handler(bot, message).await,
            KeyboardAction::Limit => limit_handler(bot, state, message).await,
            KeyboardAction::CreateImage => image_handler(bot, state, message).await,
        };
    }

    let outcome = if state.take_image_prompt_expectation(user_id) {
        run_image_flow(&bot, &state, user_id, chat_id, &text).await
    } else {
        run_chat_turn(&bot, &state, user_id, chat_id, &text).await
    };

    if let Err(err) = outcome {
        error!("Error in message handler for user {user_id}: {err}");
        bot.send_message(chat_id, GENERIC_APOLOGY)
            .reply_markup(main_keyboard())
            .await?;
    }
    Ok(())
}

async fn run_image_flow(
    bot: &Bot,
    state: &AppState,
    user_id: i64,
    chat_id: ChatId,
    prompt: &str,
) -> Result<()> {
    if !llm::check_moderation(prompt).await {
        bot.send_message(chat_id, MODERATION_REFUSAL)
            .reply_markup(main_keyboard())
            .await?;
        return Ok(());
    }

    bot.send_message(
        chat_id,
        "Генерирую изображение, это может занять до 30 секунд...",
    )
    .await?;
    let upload_action =
        start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::UploadPhoto);

    let result = llm::generate_image(&state.db, user_id, prompt, None).await;
    drop(upload_action);

    match result {
        Ok(image_url) => {
            bot.send_photo(chat_id, InputFile::url(Url::parse(&image_url)?))
                .caption(format!("Изображение по запросу: {prompt}"))
                .reply_markup(main_keyboard())
                .await?;
        }
        Err(err) => {
            warn!("Image generation failed for user {user_id}: {err}");
            bot.send_message(
                chat_id,
                format!("Не удалось создать изображение: {}", err.user_message()),
            )
            .reply_markup(main_keyboard())
            .await?;
        }
    }
    Ok(())
}

async fn run_chat_turn(
    bot: &Bot,
    state: &AppState,
    user_id: i64,
    chat_id: ChatId,
    text: &str,
) -> Result<()> {
    let subscribed = billing::is_subscribed(&state.db, user_id).await?;
    if !subscribed {
        let (used, limit) = billing::get_usage(&state.db, user_id).await?;
        if used >= limit {
            bot.send_message(chat_id, QUOTA_EXCEEDED)
                .reply_markup(subscribe_keyboard())
                .await?;
            return Ok(());
        }
    }

    memory::append_turn(&state.db, user_id, "user", text).await?;

    let window = memory::recent_window(&state.db, user_id, SHORT_MEMORY_WINDOW).await?;
    let summary = memory::latest_summary(&state.db, user_id).await?;
    let system_prompt = state.db.system_prompt().await?;

    let typing = start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::Typing);
    tokio::time::sleep(thinking_delay(text.chars().count())).await;

    let tier = ModelTier::for_subscription(subscribed);
    let reply = match llm::complete(
        system_prompt.as_deref(),
        summary.as_deref(),
        &window,
        text,
        tier,
    )
    .await
    {
        Ok(reply) => reply,
        Err(err) => {
            warn!("Chat completion failed for user {user_id}: {err}");
            err.user_message().to_string()
        }
    };
    drop(typing);

    memory::append_turn(&state.db, user_id, "assistant", &reply).await?;
    bot.send_message(chat_id, reply)
        .reply_markup(main_keyboard())
        .await?;

    if memory::should_summarize(window.len()) {
        summarize_window(state, user_id, &window, system_prompt.as_deref(), tier).await;
    }
    Ok(())
}

/// Compresses the fetched window into a stored summary. Failures are
/// logged and never affect the already-sent reply.
async fn summarize_window(
    state: &AppState,
    user_id: i64,
    window: &[llm::ChatTurn],
    system_prompt: Option<&str>,
    tier: ModelTier,
) {
    let request = memory::build_summary_request(window);
    match llm::complete(system_prompt, None, &[], &request, tier).await {
        Ok(summary_text) => {
            if let Err(err) = memory::record_summary(&state.db, user_id, &summary_text).await {
                error!("Failed to store summary for user {user_id}: {err}");
            }
        }
        Err(err) => {
            error!("Error creating summary for user {user_id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_labels_resolve_to_the_closed_action_set() {
        assert_eq!(classify_button(BTN_HELP), Some(KeyboardAction::Help));
        assert_eq!(
            classify_button(BTN_SUBSCRIBE),
            Some(KeyboardAction::Subscribe)
        );
        assert_eq!(
            classify_button(BTN_SUBSCRIBE_ACTION),
            Some(KeyboardAction::Subscribe)
        );
        assert_eq!(
            classify_button(BTN_NEW_DIALOG),
            Some(KeyboardAction::NewDialog)
        );
        assert_eq!(classify_button(BTN_LIMIT), Some(KeyboardAction::Limit));
        assert_eq!(
            classify_button(BTN_CREATE_IMAGE),
            Some(KeyboardAction::CreateImage)
        );
        assert_eq!(classify_button("просто текст"), None);
    }

    #[test]
    fn thinking_delay_grows_with_length_and_caps() {
        assert_eq!(thinking_delay(0), Duration::from_secs_f32(0.5));
        assert_eq!(thinking_delay(500), Duration::from_secs_f32(1.5));
        assert_eq!(thinking_delay(100_000), Duration::from_secs_f32(1.5));
        assert!(thinking_delay(100) > thinking_delay(0));
    }
}
