//! Text-mode console front end for Agent Lee.
//!
//! Typed lines are submitted as prompts; spoken replies are printed. A few
//! slash commands drive the controller directly.

use agent_lee::contacts::InMemoryContactBook;
use agent_lee::model::{GeminiClient, GeminiConfig, system_instruction};
use agent_lee::notes::InMemoryNoteStore;
use agent_lee::speech::{
    SpeechOutputManager, SpeechSynthesizer, SynthesisError, TomlVoicePreference, Utterance, Voice,
};
use agent_lee::{
    AssistantConfig, Collaborators, ControllerHandle, RuntimeEvent, Speaker, TurnController,
};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Pace of the console "voice", so interrupts have something to cut off.
const WORD_MS: u64 = 120;

/// Agent Lee: a voice-first personal agent, in text mode.
#[derive(Parser)]
#[command(name = "agent-lee", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent_lee=info,reqwest=warn,hyper=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(AssistantConfig::default_config_path);
    let mut config = if config_path.exists() {
        AssistantConfig::from_file(&config_path)?
    } else {
        AssistantConfig::default()
    };
    config.validate()?;

    let name = config.assistant.name.clone();
    let gemini = GeminiConfig::from_model_config(&config.model)?.with_system_instruction(
        system_instruction(&name, config.assistant.user_name.as_deref()),
    );
    let synth = Arc::new(ConsoleSynth::new(&name));
    let speech = Arc::new(SpeechOutputManager::new(
        synth,
        Arc::new(TomlVoicePreference::new(&config_path)),
        config.speech.clone(),
        name.clone(),
    ));

    let shutdown = CancellationToken::new();
    let keep_alive = speech.spawn_keep_alive(shutdown.clone());

    let (controller, handle) = TurnController::new(
        config.clone(),
        Collaborators {
            model: Arc::new(GeminiClient::new(gemini)),
            speech,
            contacts: Arc::new(InMemoryContactBook::new(Vec::new())),
            notes: Arc::new(InMemoryNoteStore::new()),
            visual: None,
        },
    );
    tokio::spawn(print_events(handle.subscribe()));
    let controller = tokio::spawn(controller.run());

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            let _ = ctrl_c.shutdown().await;
        }
    });

    println!("{name} v{}", env!("CARGO_PKG_VERSION"));
    println!("Type a prompt and press Enter. /stop interrupts, /resume replays, /quit exits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if !config.assistant.onboarding_complete {
        println!("{name}: Hello, I'm {name}. What should I call you?");
        if let Some(user_name) = lines.next_line().await? {
            match handle.complete_onboarding(user_name).await {
                Ok(()) => persist_onboarding(&handle, &mut config, &config_path).await,
                Err(e) => println!("{e}"),
            }
        }
    }

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/quit" | "/exit" => break,
            "/stop" => handle.interrupt().await?,
            "/resume" => {
                if !handle.resume_interrupted().await? {
                    println!("(nothing to resume)");
                }
            }
            "/state" => println!("({})", handle.state()),
            text => match handle.submit(text).await {
                Ok(_) => {}
                // Rejections are already printed from the event stream.
                Err(e) if e.is_input_rejection() => debug!("submission rejected: {e}"),
                Err(e) => return Err(e.into()),
            },
        }
    }

    let _ = handle.shutdown().await;
    controller.await?;
    shutdown.cancel();
    if let Some(task) = keep_alive {
        let _ = task.await;
    }
    Ok(())
}

/// Save the onboarded name so the next start skips onboarding.
async fn persist_onboarding(
    handle: &ControllerHandle,
    config: &mut AssistantConfig,
    path: &std::path::Path,
) {
    let Ok(snapshot) = handle.snapshot().await else {
        return;
    };
    config.assistant.user_name = snapshot.user_name;
    config.assistant.onboarding_complete = snapshot.onboarding_complete;
    if let Err(e) = config.save_to_file(path) {
        warn!("failed to save config to {}: {e}", path.display());
    }
}

async fn print_events(mut events: broadcast::Receiver<RuntimeEvent>) {
    loop {
        match events.recv().await {
            Ok(RuntimeEvent::TranscriptAppended(entry)) if entry.speaker == Speaker::System => {
                println!("{}", entry.text);
            }
            Ok(RuntimeEvent::BrowserOpened { url }) => println!("[browser] {url}"),
            Ok(RuntimeEvent::DialRequested { number }) => println!("[dialer] {number}"),
            Ok(RuntimeEvent::FeatureChanged(feature)) => println!("[panel] {feature}"),
            Ok(RuntimeEvent::ImageGenerated { prompt, data_url }) => {
                println!("[image] \"{prompt}\" ({} bytes)", data_url.len());
            }
            Ok(RuntimeEvent::SubmissionQueued { pending, .. }) => {
                println!("(queued, {pending} waiting)");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "console fell behind the event stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Prints each utterance and takes as long as reading it aloud would.
struct ConsoleSynth {
    name: String,
    speaking: AtomicBool,
    cancel: Notify,
}

impl ConsoleSynth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            speaking: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ConsoleSynth {
    async fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            name: "Console".to_owned(),
            uri: "console".to_owned(),
            lang: "en-US".to_owned(),
            is_default: true,
        }]
    }

    async fn speak(&self, utterance: Utterance) -> Result<(), SynthesisError> {
        // Keep-alive pings are silent.
        if utterance.text.trim().is_empty() {
            return Ok(());
        }
        println!("{}: {}", self.name, utterance.text);
        let words = utterance.text.split_whitespace().count() as u64;
        self.speaking.store(true, Ordering::SeqCst);
        let result = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(words * WORD_MS)) => Ok(()),
            _ = self.cancel.notified() => Err(SynthesisError::Canceled),
        };
        self.speaking.store(false, Ordering::SeqCst);
        result
    }

    fn cancel(&self) {
        self.speaking.store(false, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}
