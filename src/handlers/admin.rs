use anyhow::Result;
use chrono::{Duration, Utc};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use tracing::{error, info, warn};

use crate::billing;
use crate::config::CONFIG;
use crate::state::{AppState, PendingAdminAction};
use crate::utils::telegram::escape_html;

pub const ADMIN_CONFIRM_CALLBACK: &str = "admin_action_confirm";
pub const ADMIN_CANCEL_CALLBACK: &str = "admin_action_cancel";

const ACCESS_DENIED: &str = "Доступ запрещён.";
const BROADCAST_PROGRESS_STEP: usize = 10;

fn admin_sender(message: &Message) -> Option<i64> {
    let user_id = message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())?;
    CONFIG.is_admin(user_id).then_some(user_id)
}

/// Resolves the sender as an admin or answers with a denial.
async fn require_admin(bot: &Bot, message: &Message) -> Result<Option<i64>> {
    match admin_sender(message) {
        Some(admin_id) => Ok(Some(admin_id)),
        None => {
            bot.send_message(message.chat.id, ACCESS_DENIED).await?;
            Ok(None)
        }
    }
}

fn confirm_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([[
        InlineKeyboardButton::callback("✅ Подтвердить", ADMIN_CONFIRM_CALLBACK),
        InlineKeyboardButton::callback("❌ Отменить", ADMIN_CANCEL_CALLBACK),
    ]])
}

pub async fn admin_panel_handler(bot: Bot, message: Message) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    let panel = "🔑 <b>Админ-панель</b>\n\n\
<b>Основные команды:</b>\n\
/stats - Статистика использования\n\
/users - Список пользователей\n\
/broadcast - Отправить сообщение всем\n\n\
<b>Настройки бота:</b>\n\
/set_prompt - Изменить системный промпт\n\
/show_prompt - Показать текущий промпт\n\
/clean_db - Очистить старые сообщения\n\n\
<b>Управление подписками:</b>\n\
/add_subscription ID DAYS - Выдать подписку\n\
/check_sub ID - Проверить подписку пользователя";
    bot.send_message(message.chat.id, panel)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

pub async fn stats_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    let stats = state.db.stats(Utc::now()).await?;
    let conversion = stats.subscribers as f64 / stats.users.max(1) as f64 * 100.0;
    let text = format!(
        "📊 <b>Статистика на {}</b>\n\n\
👥 Пользователей: {}\n\
💳 Активных подписчиков: {}\n\
💬 Сообщений за день: {}\n\n\
Коэффициент конверсии: {:.1}%",
        Utc::now().format("%d.%m.%Y"),
        stats.users,
        stats.subscribers,
        stats.messages_today,
        conversion
    );
    bot.send_message(message.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

pub async fn users_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    let users = state.db.all_users().await?;
    if users.is_empty() {
        bot.send_message(message.chat.id, "Пользователей пока нет.")
            .await?;
        return Ok(());
    }

    let total = users.len();
    let listed: Vec<String> = users
        .iter()
        .take(20)
        .map(|user| {
            format!(
                "ID: {} — Активность: {}",
                user.user_id,
                user.last_active.format("%d.%m %H:%M")
            )
        })
        .collect();
    let text = format!(
        "👥 <b>Последние {} пользователей:</b>\n\n{}\n\nВсего пользователей: {}",
        listed.len(),
        listed.join("\n"),
        total
    );
    bot.send_message(message.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

pub async fn broadcast_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    text: Option<String>,
) -> Result<()> {
    let Some(admin_id) = require_admin(&bot, &message).await? else {
        return Ok(());
    };

    let Some(text) = text else {
        bot.send_message(message.chat.id, "Укажите текст для рассылки после команды.")
            .await?;
        return Ok(());
    };

    state.stage_admin_action(admin_id, PendingAdminAction::Broadcast { text: text.clone() });
    bot.send_message(
        message.chat.id,
        format!(
            "<b>Предпросмотр сообщения:</b>\n\n{}\n\n\
Сообщение будет отправлено всем пользователям. Подтвердите действие.",
            escape_html(&text)
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_markup(confirm_keyboard())
    .await?;
    Ok(())
}

pub async fn set_prompt_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    prompt: Option<String>,
) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    let Some(prompt) = prompt else {
        bot.send_message(
            message.chat.id,
            "Укажите текст промпта после команды.\n\
Пример: /set_prompt Ты — дружелюбный ассистент. Отвечай коротко и по делу.",
        )
        .await?;
        return Ok(());
    };

    state.db.set_system_prompt(&prompt).await?;
    bot.send_message(message.chat.id, "✅ Промпт обновлён.").await?;
    Ok(())
}

pub async fn show_prompt_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    match state.db.system_prompt().await? {
        Some(prompt) => {
            bot.send_message(
                message.chat.id,
                format!(
                    "📝 <b>Текущий системный промпт:</b>\n\n{}",
                    escape_html(&prompt)
                ),
            )
            .parse_mode(ParseMode::Html)
            .await?;
        }
        None => {
            bot.send_message(message.chat.id, "Системный промпт не задан.")
                .await?;
        }
    }
    Ok(())
}

pub async fn clean_db_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    arg: Option<String>,
) -> Result<()> {
    let Some(admin_id) = require_admin(&bot, &message).await? else {
        return Ok(());
    };

    let days = match arg {
        None => CONFIG.message_retention_days,
        Some(value) => match value.trim().parse::<i64>() {
            Ok(days) if days > 0 => days,
            _ => {
                bot.send_message(
                    message.chat.id,
                    "❌ Неверный формат. Укажите количество дней числом.",
                )
                .await?;
                return Ok(());
            }
        },
    };

    state.stage_admin_action(admin_id, PendingAdminAction::Cleanup { days });
    bot.send_message(
        message.chat.id,
        format!(
            "⚠️ <b>Внимание!</b>\n\n\
Вы собираетесь удалить все сообщения старше {days} дней.\n\
Эта операция необратима. Подтвердите действие."
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_markup(confirm_keyboard())
    .await?;
    Ok(())
}

pub async fn add_subscription_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    args: Option<String>,
) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    let usage = "ℹ️ <b>Использование:</b>\n\
/add_subscription USER_ID DAYS\n\n\
<b>Пример:</b> /add_subscription 123456789 30";
    let args = args.unwrap_or_default();
    let mut parts = args.split_whitespace();
    let (Some(user_id), Some(days)) = (parts.next(), parts.next()) else {
        bot.send_message(message.chat.id, usage)
            .parse_mode(ParseMode::Html)
            .await?;
        return Ok(());
    };

    let (Ok(user_id), Ok(days)) = (user_id.parse::<i64>(), days.parse::<i64>()) else {
        bot.send_message(
            message.chat.id,
            "❌ Неверный формат. USER_ID и DAYS должны быть числами.",
        )
        .await?;
        return Ok(());
    };
    if days <= 0 {
        bot.send_message(
            message.chat.id,
            "❌ Количество дней должно быть положительным числом.",
        )
        .await?;
        return Ok(());
    }

    let expires_at = Utc::now() + Duration::days(days);
    billing::grant_subscription(&state.db, user_id, expires_at).await?;

    bot.send_message(
        message.chat.id,
        format!(
            "✅ Подписка для пользователя {user_id} добавлена!\nДействует до: {}",
            expires_at.format("%d.%m.%Y %H:%M")
        ),
    )
    .await?;

    let notice = format!(
        "🎉 Поздравляем! Тебе активирована подписка на {days} дней.\n\
Теперь у тебя доступ к самой мощной модели без ограничений!"
    );
    if let Err(err) = bot.send_message(ChatId(user_id), notice).await {
        warn!("Failed to notify user {user_id} about granted subscription: {err}");
        bot.send_message(
            message.chat.id,
            "⚠️ Не удалось отправить уведомление пользователю.",
        )
        .await?;
    }
    Ok(())
}

pub async fn check_sub_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    arg: Option<String>,
) -> Result<()> {
    if require_admin(&bot, &message).await?.is_none() {
        return Ok(());
    }

    let Some(user_id) = arg.and_then(|value| value.trim().parse::<i64>().ok()) else {
        bot.send_message(
            message.chat.id,
            "Укажите ID пользователя: /check_sub USER_ID",
        )
        .await?;
        return Ok(());
    };

    match state.db.effective_subscription(user_id, Utc::now()).await? {
        Some(sub) => {
            bot.send_message(
                message.chat.id,
                format!(
                    "✅ У пользователя {user_id} есть активная подписка\nДействует до: {}",
                    sub.expires_at.format("%d.%m.%Y %H:%M")
                ),
            )
            .await?;
        }
        None => {
            bot.send_message(
                message.chat.id,
                format!("❌ У пользователя {user_id} нет активной подписки"),
            )
            .await?;
        }
    }
    Ok(())
}

/// Executes or discards the staged admin action when a confirm/cancel
/// button is pressed.
pub async fn admin_action_callback(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let _ = bot.answer_callback_query(query.id.clone()).await;
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let admin_id = i64::try_from(query.from.id.0).unwrap_or_default();
    if !CONFIG.is_admin(admin_id) {
        return Ok(());
    }
    let Some(message) = query.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id;
    let message_id = message.id();

    match data {
        ADMIN_CANCEL_CALLBACK => {
            state.take_admin_action(admin_id);
            bot.edit_message_text(chat_id, message_id, "❌ Операция отменена.")
                .await?;
        }
        ADMIN_CONFIRM_CALLBACK => {
            let Some(action) = state.take_admin_action(admin_id) else {
                bot.edit_message_text(chat_id, message_id, "Нет ожидающей операции.")
                    .await?;
                return Ok(());
            };
            match action {
                PendingAdminAction::Broadcast { text } => {
                    run_broadcast(&bot, &state, chat_id, message_id, &text).await?;
                }
                PendingAdminAction::Cleanup { days } => {
                    run_cleanup(&bot, &state, chat_id, message_id, days).await?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

async fn run_broadcast(
    bot: &Bot,
    state: &AppState,
    chat_id: ChatId,
    message_id: teloxide::types::MessageId,
    text: &str,
) -> Result<()> {
    let users = state.db.all_users().await?;
    let total = users.len();
    bot.edit_message_text(
        chat_id,
        message_id,
        format!("Отправка сообщений...\nОбработано: 0 из {total}"),
    )
    .await?;

    let mut delivered = 0usize;
    let mut failed = 0usize;
    for (index, user) in users.iter().enumerate() {
        match bot
            .send_message(ChatId(user.user_id), text.to_string())
            .await
        {
            Ok(_) => delivered += 1,
            Err(err) => {
                error!("Error sending broadcast to {}: {err}", user.user_id);
                failed += 1;
            }
        }

        if (index + 1) % BROADCAST_PROGRESS_STEP == 0 {
            let _ = bot
                .edit_message_text(
                    chat_id,
                    message_id,
                    format!("Отправка сообщений...\nОбработано: {} из {total}", index + 1),
                )
                .await;
        }
    }

    info!("Broadcast finished: delivered={delivered} failed={failed}");
    bot.edit_message_text(
        chat_id,
        message_id,
        format!("✅ Рассылка завершена.\nДоставлено: {delivered}\nНе доставлено: {failed}"),
    )
    .await?;
    Ok(())
}

async fn run_cleanup(
    bot: &Bot,
    state: &AppState,
    chat_id: ChatId,
    message_id: teloxide::types::MessageId,
    days: i64,
) -> Result<()> {
    bot.edit_message_text(chat_id, message_id, "🔄 Удаление старых сообщений...")
        .await?;

    let cutoff = Utc::now() - Duration::days(days);
    let deleted = state.db.delete_messages_older_than(cutoff).await?;
    info!("Retention sweep removed {deleted} messages older than {days} days");

    bot.edit_message_text(
        chat_id,
        message_id,
        format!("✅ Очистка завершена.\nУдалено {deleted} сообщений старше {days} дней."),
    )
    .await?;
    Ok(())
}
