use std::error::Error;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use adventure_web::resolver::{ScoreCard, score_candidates};
use adventure_web::session::read_segment_dir;
use adventure_web::{Choice, Navigator, RawSegment, Segment, SegmentCollection, parse_source, resolve_key};
use atty::Stream;
use clap::{Parser, Subcommand};
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "adventure-web",
    about = "Read and serve generated choose-your-own-adventure stories",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse one markdown segment file and print its parts.
    Parse {
        /// Path to the segment file.
        file: PathBuf,
    },
    /// Show which segment a link target opens, with per-rule scores.
    Resolve {
        /// Directory holding the story's markdown files.
        dir: PathBuf,
        /// Link target, e.g. `/stories/forest-path`.
        target: String,
        /// Visible link text.
        #[arg(long, default_value = "")]
        label: String,
    },
    /// Read a story directory in the terminal.
    Play {
        /// Directory holding the story's markdown files.
        dir: PathBuf,
    },
    /// Run the HTTP server.
    #[cfg(feature = "web")]
    Serve(serve::ServeArgs),
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Parse { file } => {
            init_tracing("warn");
            handle_parse(&file, cli.json)
        }
        Command::Resolve { dir, target, label } => {
            init_tracing("warn");
            handle_resolve(&dir, &target, &label, cli.json)
        }
        Command::Play { dir } => {
            init_tracing("warn");
            handle_play(&dir, cli.json)
        }
        #[cfg(feature = "web")]
        Command::Serve(args) => {
            init_tracing("info");
            serve::handle_serve(args)
        }
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the per-command default.
fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn read_story(dir: &Path) -> Result<Vec<RawSegment>, Box<dyn Error>> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()).into());
    }
    let raw = read_segment_dir(dir);
    if raw.is_empty() {
        return Err(format!("No markdown files found in {}", dir.display()).into());
    }
    Ok(raw)
}

fn handle_parse(file: &Path, as_json: bool) -> Result<(), Box<dyn Error>> {
    let raw = fs::read_to_string(file)
        .map_err(|err| format!("Failed to read {}: {err}", file.display()))?;
    let source = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let segment = parse_source(&source, &raw);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&segment)?);
    } else {
        print_segment(&segment);
    }
    Ok(())
}

fn handle_resolve(dir: &Path, target: &str, label: &str, as_json: bool) -> Result<(), Box<dyn Error>> {
    let collection = SegmentCollection::build(&read_story(dir)?);
    let choice = Choice::new(label, target);
    let (key, resolution) = resolve_key(&choice, &collection);
    let segment = collection.get(key).unwrap_or_else(|| collection.entry());
    let cards = score_candidates(choice.target_ref(), label, &collection);

    if as_json {
        let payload = json!({
            "target": target,
            "label": label,
            "resolution": resolution,
            "segment": { "source": segment.source, "title": segment.title },
            "candidates": cards,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("Target:     {target}");
        println!("Resolution: {resolution:?}");
        println!("Segment:    {} ({})", segment.title, display_source(segment));
        print_score_table(&collection, &cards);
    }
    Ok(())
}

fn handle_play(dir: &Path, as_json: bool) -> Result<(), Box<dyn Error>> {
    let raw = read_story(dir)?;
    let mut navigator = Navigator::new();
    navigator.load(&raw);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        let Some(segment) = navigator.current() else {
            break;
        };
        let choice_count = segment.choices.len();
        if as_json {
            println!("{}", serde_json::to_string(segment)?);
        } else {
            print_play_view(segment, navigator.depth(), navigator.can_go_back());
        }
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        match line?.trim() {
            "q" | "quit" => break,
            "b" | "back" => {
                navigator.back();
            }
            "r" | "restart" => {
                navigator.restart();
            }
            input => match input.parse::<usize>() {
                Ok(number) if (1..=choice_count).contains(&number) => {
                    navigator.select_index(number - 1);
                }
                _ => println!("Enter a choice number, b (back), r (restart) or q (quit)."),
            },
        }
    }
    Ok(())
}

fn display_source(segment: &Segment) -> &str {
    if segment.source.is_empty() {
        "<unnamed>"
    } else {
        &segment.source
    }
}

fn print_segment(segment: &Segment) {
    println!("Source: {}", display_source(segment));
    println!("Title:  {}", segment.title);
    println!("Image:  {}", segment.image.as_deref().unwrap_or("<none>"));
    print_choices(segment);
    render_markdown_block("Body", &segment.body);
}

fn print_choices(segment: &Segment) {
    if segment.choices.is_empty() {
        println!("Choices: <none>");
        return;
    }
    println!("Choices:");
    for (index, choice) in segment.choices.iter().enumerate() {
        println!("  {}. {} -> {}", index + 1, choice.label, choice.target);
    }
}

fn print_play_view(segment: &Segment, depth: usize, can_go_back: bool) {
    println!("\n== {} ==", segment.title);
    if let Some(image) = &segment.image {
        println!("[image: {image}]");
    }
    render_markdown(&segment.body);
    if segment.choices.is_empty() {
        println!("\nThe End.");
    } else {
        println!();
        for (index, choice) in segment.choices.iter().enumerate() {
            println!("  {}. {}", index + 1, choice.label);
        }
    }
    let back = if can_go_back { "b back, " } else { "" };
    println!("\n(step {depth}; {back}r restart, q quit)");
}

fn print_score_table(collection: &SegmentCollection, cards: &[ScoreCard]) {
    if cards.is_empty() {
        println!("No candidate segments besides the entry.");
        return;
    }
    let width = cards
        .iter()
        .map(|card| card.title.len())
        .max()
        .unwrap_or(5)
        .max("TITLE".len());
    println!();
    println!("{:<width$}  {:>5}  {}", "TITLE", "TOTAL", "RULES", width = width);
    println!("{:-<width$}  {:->5}  {}", "", "", "-----", width = width);
    for card in cards {
        let rules = card
            .rules
            .iter()
            .filter(|(_, score)| *score > 0)
            .map(|(name, score)| format!("{name}={score}"))
            .collect::<Vec<_>>()
            .join(", ");
        let source = collection
            .others()
            .get(card.key_index)
            .map(display_source)
            .unwrap_or("?");
        println!(
            "{:<width$}  {:>5}  {} [{}]",
            card.title,
            card.total,
            if rules.is_empty() { "-" } else { rules.as_str() },
            source,
            width = width
        );
    }
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown(body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}

fn render_markdown_block(title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    println!("\n{title}:");
    render_markdown(body);
}

#[cfg(feature = "web")]
mod serve {
    use std::error::Error;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    use adventure_web::generator::GeneratorConfig;
    use adventure_web::web::{WebConfig, WebTheme, serve};
    use clap::{ArgAction, Args, ValueEnum};

    #[derive(Debug, Clone, Copy, ValueEnum)]
    pub enum ThemeArg {
        Tailwind,
        Bootstrap,
    }

    impl From<ThemeArg> for WebTheme {
        fn from(value: ThemeArg) -> Self {
            match value {
                ThemeArg::Tailwind => WebTheme::Tailwind,
                ThemeArg::Bootstrap => WebTheme::Bootstrap,
            }
        }
    }

    #[derive(Args, Debug)]
    pub struct ServeArgs {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// Public base URL used for canonical links.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        base_url: String,
        #[arg(long, value_enum, default_value_t = ThemeArg::Tailwind)]
        theme: ThemeArg,
        /// Directory holding one sub-directory per story session.
        #[arg(long, default_value = "data/sessions")]
        data_dir: PathBuf,
        /// Story generation script.
        #[arg(long, default_value = "main.py")]
        script: PathBuf,
        /// Interpreter used to run the script.
        #[arg(long, default_value = "python3")]
        python: String,
        /// Working directory for the script; relative script paths resolve here.
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Seconds before a generation run is killed.
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
        /// Pass `--no-cache` to the script.
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        no_cache: bool,
        /// Largest accepted upload request, in MiB.
        #[arg(long, default_value_t = 50)]
        max_upload_mb: usize,
        /// Reader views kept in memory before the oldest is dropped.
        #[arg(long, default_value_t = 4096)]
        max_views: usize,
        /// Do not serve the OpenAPI document.
        #[arg(long)]
        no_openapi: bool,
    }

    impl ServeArgs {
        fn into_config(self) -> WebConfig {
            WebConfig {
                addr: self.addr,
                enable_openapi: !self.no_openapi,
                theme: self.theme.into(),
                base_url: self.base_url,
                data_dir: self.data_dir,
                generator: GeneratorConfig {
                    program: self.python,
                    script: self.script,
                    working_dir: self.workdir,
                    timeout: Duration::from_secs(self.timeout_secs),
                    no_cache: self.no_cache,
                },
                max_upload_bytes: self.max_upload_mb.saturating_mul(1024 * 1024),
                max_views: self.max_views,
            }
        }
    }

    pub fn handle_serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(serve(args.into_config()))?;
        Ok(())
    }
}
