use std::error::Error;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

mod billing;
mod config;
mod db;
mod handlers;
mod llm;
mod memory;
mod notifier;
mod state;
mod utils;

use config::{CONFIG, DEFAULT_SYSTEM_PROMPT};
use db::Database;
use handlers::admin::{ADMIN_CANCEL_CALLBACK, ADMIN_CONFIRM_CALLBACK};
use handlers::{admin, user};
use state::AppState;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case")]
enum Command {
    Start,
    Help,
    New,
    Limit,
    Subscribe,
    Image,
    Admin,
    Stats,
    Users,
    Broadcast(String),
    SetPrompt(String),
    ShowPrompt,
    CleanDb(String),
    AddSubscription(String),
    CheckSub(String),
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Seeds the system prompt from the bundled default on a fresh database.
async fn seed_system_prompt(db: &Database) -> anyhow::Result<()> {
    if db.system_prompt().await?.is_none() {
        db.set_system_prompt(DEFAULT_SYSTEM_PROMPT).await?;
        info!("Default system prompt loaded");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    info!("Initializing database...");
    let db = Database::init(&CONFIG.database_url).await?;
    seed_system_prompt(&db).await?;

    let bot = Bot::new(CONFIG.bot_token.clone());
    let state = AppState::new(db.clone());

    tokio::spawn(notifier::run(bot.clone(), db));

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .endpoint(handle_plain_message);

    let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    info!("Starting bot...");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    fn optional_arg(arg: String) -> Option<String> {
        if arg.trim().is_empty() {
            None
        } else {
            Some(arg)
        }
    }

    match command {
        Command::Start => user::start_handler(bot, state, message).await?,
        Command::Help => user::help_handler(bot, message).await?,
        Command::New => user::new_dialog_handler(bot, message).await?,
        Command::Limit => user::limit_handler(bot, state, message).await?,
        Command::Subscribe => user::subscribe_handler(bot, state, message).await?,
        Command::Image => user::image_handler(bot, state, message).await?,
        Command::Admin => admin::admin_panel_handler(bot, message).await?,
        Command::Stats => admin::stats_handler(bot, state, message).await?,
        Command::Users => admin::users_handler(bot, state, message).await?,
        Command::Broadcast(arg) => {
            admin::broadcast_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::SetPrompt(arg) => {
            admin::set_prompt_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::ShowPrompt => admin::show_prompt_handler(bot, state, message).await?,
        Command::CleanDb(arg) => {
            admin::clean_db_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::AddSubscription(arg) => {
            admin::add_subscription_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::CheckSub(arg) => {
            admin::check_sub_handler(bot, state, message, optional_arg(arg)).await?
        }
    }
    Ok(())
}

/// Every non-command message runs in its own task so a slow model call
/// never blocks the dispatcher.
async fn handle_plain_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    tokio::spawn(async move {
        if let Err(err) = user::handle_message(bot, state, message).await {
            error!("message handler failed: {err}");
        }
    });
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    let Some(data) = query.data.clone() else {
        return Ok(());
    };
    if data == ADMIN_CONFIRM_CALLBACK || data == ADMIN_CANCEL_CALLBACK {
        tokio::spawn(async move {
            if let Err(err) = admin::admin_action_callback(bot, state, query).await {
                error!("admin action callback failed: {err}");
            }
        });
    }
    Ok(())
}
