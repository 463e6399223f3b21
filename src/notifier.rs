use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Timelike, Utc};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{error, info};

use crate::config::CONFIG;
use crate::db::Database;

const POLL_INTERVAL: Duration = Duration::from_secs(300);
const POST_SWEEP_SLEEP: Duration = Duration::from_secs(3600);

/// Background loop that warns users about soon-to-expire subscriptions.
/// Polls every five minutes and runs the sweep once within the 10:00-10:05
/// local window, then sleeps an hour so it cannot re-fire the same day.
/// Failures are logged and the loop keeps running; message handling is
/// never affected.
pub async fn run(bot: Bot, db: Database) {
    info!("Subscription notifier started");
    loop {
        let now = Local::now();
        if now.hour() == 10 && now.minute() < 5 {
            if let Err(err) = sweep_expiring_subscriptions(&bot, &db).await {
                error!("Error checking expiring subscriptions: {err}");
            }
            tokio::time::sleep(POST_SWEEP_SLEEP).await;
        } else {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn sweep_expiring_subscriptions(bot: &Bot, db: &Database) -> Result<()> {
    let expiring = db
        .expiring_subscriptions(Utc::now(), CONFIG.notify_before_expiration)
        .await?;

    for sub in expiring {
        let text = format!(
            "⚠️ <b>Внимание!</b>\n\n\
Твоя подписка истекает {}.\n\
Чтобы продолжить пользоваться всеми преимуществами, \
не забудь продлить подписку командой /subscribe.",
            sub.expires_at.format("%d.%m.%Y")
        );
        match bot
            .send_message(ChatId(sub.user_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) => info!("Sent expiration notification to user {}", sub.user_id),
            Err(err) => error!(
                "Failed to send expiration notification to user {}: {err}",
                sub.user_id
            ),
        }
    }
    Ok(())
}
