use std::io::{self, BufRead, Write};
use std::sync::Arc;

use veilrun::engine::Engine;
use veilrun::llm::{LlmGateway, ScriptedGateway, TextGenerator};
use veilrun::settings::{Settings, StorageBackend};
use veilrun::stats::StatsLedger;
use veilrun::storage::{FileStorage, MemoryStorage, Storage};
use veilrun::world::{WorldModel, demo_world};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(err) = veilrun::logging::init() {
        eprintln!("logging unavailable: {err}");
    }

    let mut settings = Settings::load().unwrap_or_else(|err| {
        eprintln!("settings unreadable ({err}), using defaults");
        Settings::new()
    });

    let mut world = match std::env::args().nth(1) {
        Some(path) => WorldModel::load(std::path::Path::new(&path))?,
        None => demo_world(),
    };

    let online = settings.openai_api_key.is_some() || settings.preferred_api_key.is_some();
    let gateway: Arc<dyn TextGenerator> = if online {
        Arc::new(LlmGateway::new(
            settings.openai_api_key.clone(),
            settings
                .preferred_api_base
                .clone()
                .zip(settings.preferred_api_key.clone()),
        ))
    } else {
        eprintln!("no API key configured; running offline with scripted replies");
        settings.nlp_command_interpretation_enabled = false;
        Arc::new(ScriptedGateway::new(vec![]))
    };

    let storage: Arc<dyn Storage> = match settings.storage_backend {
        StorageBackend::Filesystem => Arc::new(FileStorage::default()),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };

    let ledger = Arc::new(StatsLedger::new());
    if online {
        world
            .select_wise_guide(gateway.as_ref(), &ledger, settings.guide_model())
            .await;
    }

    let engine = Engine::new(world, gateway, ledger, storage, settings);
    let player_id = std::env::var("VEILRUN_PLAYER").unwrap_or_else(|_| "seeker".to_string());

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    println!("veilrun - type /help for commands, /exit to leave.");
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let outcome = engine.process_turn(&player_id, line.trim()).await?;
        for msg in &outcome.system_messages {
            println!("{msg}");
        }
        if !outcome.npc_response.is_empty() {
            let speaker = outcome
                .current_npc_name
                .as_deref()
                .unwrap_or("The Veil");
            println!("{speaker} > {}", outcome.npc_response);
        }
        if outcome.status == "exit" {
            break;
        }
    }

    engine.close_player_session(&player_id).await?;
    log::info!("session ended: {}", engine.session_summary());
    Ok(())
}
