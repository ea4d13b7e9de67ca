use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use search_onboard::api::{HttpBackend, MemoryBackend, OnboardingApi};
use search_onboard::cache::LogInvalidator;
use search_onboard::config::Settings;
use search_onboard::onboarding::{
    CrawlCadence, CrawlDepth, CrawlPhase, DataSourceForm, NoticeLevel, OnboardingController,
    StepOrigin, WizardEvent, WizardStep,
};

/// What the user typed at a prompt.
enum Input {
    Text(String),
    Back,
    Quit,
}

/// How a step handler wants the main loop to continue.
enum Flow {
    Continue,
    Quit,
    Done,
}

struct Prompt {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompt {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Ask for a value. An empty answer keeps `current`.
    async fn ask(&mut self, label: &str, current: &str) -> anyhow::Result<Input> {
        if current.is_empty() {
            eprint!("{label}: ");
        } else {
            eprint!("{label} [{current}]: ");
        }
        let Some(line) = self.lines.next_line().await? else {
            return Ok(Input::Quit); // EOF
        };
        let line = line.trim();
        Ok(match line {
            "back" => Input::Back,
            "quit" | "exit" => Input::Quit,
            "" => Input::Text(current.to_string()),
            other => Input::Text(other.to_string()),
        })
    }
}

/// Ask and bail out of the step handler on `back`/`quit`.
macro_rules! ask_or_flow {
    ($prompt:expr, $controller:expr, $label:expr, $current:expr) => {
        match $prompt.ask($label, $current).await? {
            Input::Text(value) => value,
            Input::Back => {
                let _ = $controller.back().await;
                return Ok(Flow::Continue);
            }
            Input::Quit => return Ok(Flow::Quit),
        }
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = Settings::from_env()?;
    let api: Arc<dyn OnboardingApi> = match settings.api {
        Some(api_config) => {
            eprintln!("   Backend: {}", api_config.base_url);
            Arc::new(HttpBackend::new(api_config)?)
        }
        _ => {
            eprintln!("   Backend: in-memory (offline)");
            Arc::new(MemoryBackend::new())
        }
    };

    eprintln!("🔎 search-onboard v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Type 'back' to return to the previous step, 'quit' to exit.\n");

    let controller = Arc::new(OnboardingController::new(
        api,
        Arc::new(LogInvalidator),
        settings.wizard,
    ));
    let _printer = spawn_event_printer(&controller);

    controller.hydrate().await?;
    controller.spawn_status_sync();

    let mut prompt = Prompt::new();
    loop {
        let step = controller.current_step().await;
        eprintln!("── Step {}/4: {} ──", step.number(), step.title());
        let flow = match step {
            WizardStep::Branding => branding_step(&controller, &mut prompt).await?,
            WizardStep::Project => project_step(&controller, &mut prompt).await?,
            WizardStep::DataSource => data_source_step(&controller, &mut prompt).await?,
            WizardStep::Test => test_step(&controller, &mut prompt).await?,
        };
        match flow {
            Flow::Continue => {}
            Flow::Quit => {
                eprintln!("Progress so far is saved on the server. Bye.");
                break;
            }
            Flow::Done => break,
        }
    }

    controller.shutdown();
    Ok(())
}

/// Print events the user should see: errors, remote step moves, crawl
/// progress, and the final redirect.
fn spawn_event_printer(controller: &OnboardingController) -> tokio::task::JoinHandle<()> {
    let mut rx = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                WizardEvent::Notice {
                    level: NoticeLevel::Error,
                    message,
                    ..
                } => eprintln!("   ✗ {message}"),
                WizardEvent::Notice { message, .. } => eprintln!("   {message}"),
                WizardEvent::StepChanged {
                    to,
                    origin: StepOrigin::Remote,
                    ..
                } => eprintln!("   (server moved the wizard to step {})", to.number()),
                WizardEvent::StepChanged { .. } => {}
                WizardEvent::CrawlPhaseChanged { phase, status } => match status {
                    Some(status) => eprintln!("   crawl {phase}: {status}"),
                    None => eprintln!("   crawl {phase}"),
                },
                WizardEvent::Redirect { to } => eprintln!("   ✓ Onboarding complete → {to}"),
            }
        }
    })
}

async fn branding_step(
    controller: &OnboardingController,
    prompt: &mut Prompt,
) -> anyhow::Result<Flow> {
    let mut org = controller.snapshot().await.organization;
    let name = ask_or_flow!(prompt, controller, "Organization name", &org.name);
    let color = ask_or_flow!(prompt, controller, "Primary color", &org.primary_color);
    let logo = ask_or_flow!(
        prompt,
        controller,
        "Logo data URI ('-' for none)",
        org.logo_data_uri.as_deref().unwrap_or_default()
    );
    org.name = name;
    org.primary_color = color;
    org.logo_data_uri = match logo.as_str() {
        "" | "-" => None,
        other => Some(other.to_string()),
    };

    controller.update_organization(org).await?;
    // Errors are printed by the event printer; the step repeats.
    let _ = controller.next().await;
    Ok(Flow::Continue)
}

async fn project_step(
    controller: &OnboardingController,
    prompt: &mut Prompt,
) -> anyhow::Result<Flow> {
    let project = controller.snapshot().await.project;
    if let Some(ref id) = project.id {
        eprintln!("   Project {} already created ({id}).", project.name);
        let _ = ask_or_flow!(prompt, controller, "Press Enter to continue", "");
    } else {
        let name = ask_or_flow!(prompt, controller, "Project name", &project.name);
        let description = ask_or_flow!(prompt, controller, "Description", &project.description);
        controller.update_project(name, description).await?;
    }
    let _ = controller.next().await;
    Ok(Flow::Continue)
}

async fn data_source_step(
    controller: &OnboardingController,
    prompt: &mut Prompt,
) -> anyhow::Result<Flow> {
    let state = controller.snapshot().await;
    if state.crawl_phase == CrawlPhase::Complete {
        let answer = ask_or_flow!(
            prompt,
            controller,
            "Crawl complete. Enter to continue, 'recrawl' to crawl again",
            ""
        );
        if answer != "recrawl" {
            let _ = controller.next().await;
            return Ok(Flow::Continue);
        }
    } else if let Some(ref id) = state.data_source.id {
        // The source exists; a restart crawls it with the saved settings.
        eprintln!("   Data source {id} crawls {}.", state.data_source.source_url);
        let _ = ask_or_flow!(prompt, controller, "Press Enter to start the crawl again", "");
    } else {
        let ds = &state.data_source;
        let url = ask_or_flow!(prompt, controller, "Site URL", &ds.source_url);
        let current_depth = ds.crawl_depth.get().to_string();
        let depth = ask_or_flow!(prompt, controller, "Crawl depth (1-5)", &current_depth);
        let current_cadence = ds.cadence.to_string();
        let cadence = ask_or_flow!(
            prompt,
            controller,
            "Cadence (hourly/daily/weekly)",
            &current_cadence
        );
        let current_headless = if ds.headless_mode { "y" } else { "n" };
        let headless = ask_or_flow!(prompt, controller, "Headless browser (y/n)", current_headless);

        let form = match parse_form(url, &depth, &cadence, &headless) {
            Ok(form) => form,
            Err(e) => {
                eprintln!("   ✗ {e}");
                return Ok(Flow::Continue);
            }
        };
        controller.update_data_source(form).await?;
    }

    let mut rx = controller.subscribe();
    if controller.start_crawl().await.is_err() {
        return Ok(Flow::Continue);
    }
    eprintln!("   Waiting for the crawl to finish (Ctrl-C to quit)...");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(WizardEvent::CrawlPhaseChanged { phase, .. }) if phase.is_terminal() => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if controller.crawl_phase().await.is_terminal() {
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => return Ok(Flow::Quit),
        }
    }

    match controller.crawl_phase().await {
        CrawlPhase::Failed => eprintln!("   The crawl failed. You can start it again."),
        CrawlPhase::Stalled => {
            eprintln!("   The crawl is taking longer than expected. You can start it again.")
        }
        _ => {}
    }
    Ok(Flow::Continue)
}

fn parse_form(
    url: String,
    depth: &str,
    cadence: &str,
    headless: &str,
) -> anyhow::Result<DataSourceForm> {
    let depth: u8 = depth.parse()?;
    Ok(DataSourceForm {
        source_url: url,
        crawl_depth: CrawlDepth::try_from(depth)?,
        cadence: cadence.parse::<CrawlCadence>()?,
        headless_mode: matches!(headless.to_ascii_lowercase().as_str(), "y" | "yes" | "true"),
    })
}

async fn test_step(controller: &OnboardingController, prompt: &mut Prompt) -> anyhow::Result<Flow> {
    let query = ask_or_flow!(prompt, controller, "Test query (empty to finish)", "");
    if !query.is_empty() {
        if let Ok(answer) = controller.run_test_query(&query).await {
            println!("\n{}\n", answer.answer);
        }
        return Ok(Flow::Continue);
    }

    if controller.finish().await.is_err() {
        return Ok(Flow::Continue);
    }
    // Give the printer a moment to show the redirect.
    tokio::task::yield_now().await;
    Ok(Flow::Done)
}
