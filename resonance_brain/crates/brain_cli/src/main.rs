use base64::Engine as _;
use brain_core::coercion::{CoercionDiagnostic, UnknownParamPolicy};
use brain_core::config::{parameters_path_from_env, PipelineOptions};
use brain_core::param_registry::ParamRegistry;
use brain_core::pipeline::{patch_document, PatchPipeline};
use brain_core::protocol::{DiffItem, GenerateResponse, PresetDocument};
use brain_core::providers::ProviderSet;
use brain_core::render::ConverterRenderer;
use brain_core::storage::{decode_preset, fetch_preset, object_key_for, FsPresetStore, PresetStore};
use clap::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "brain_cli", about = "Apply a text description to a synth preset")]
struct Args {
    #[arg(long, required_unless_present_any = ["description_file", "patch_file"])]
    description: Option<String>,

    /// Read the description from a file.
    #[arg(long, value_name = "PATH", conflicts_with = "description")]
    description_file: Option<PathBuf>,

    /// Base preset file (JSON / .vital).
    #[arg(long, value_name = "PATH", conflicts_with = "preset_id")]
    preset: Option<PathBuf>,

    /// Preset id looked up in --store-dir.
    #[arg(long, requires = "store_dir")]
    preset_id: Option<String>,

    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// openai | gemini | ollama (default: LLM_PROVIDER)
    #[arg(long)]
    provider: Option<String>,

    /// Apply a patch JSON file directly, without the LLM. Accepts either
    /// `{"changes": {...}}` or a bare parameter map.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["description", "description_file"])]
    patch_file: Option<PathBuf>,

    /// accept | drop (default: RESONANCE_UNKNOWN_PARAMS or accept)
    #[arg(long)]
    unknown_params: Option<UnknownParamPolicy>,

    /// Where to write the modified preset. Stdout when omitted.
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Save the modified preset into --store-dir under this id.
    #[arg(long, requires = "store_dir")]
    save_as: Option<String>,

    /// Write the rendered preview here.
    #[arg(long, value_name = "PATH")]
    wav: Option<PathBuf>,

    /// Converter service base URL (overrides RENDER_URL).
    #[arg(long)]
    render_url: Option<String>,

    #[arg(long, default_value_t = false)]
    skip_render: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let registry = Arc::new(ParamRegistry::load(parameters_path_from_env().as_deref())?);
    info!(parameters = registry.len(), "parameter registry loaded");
    let mut options = PipelineOptions::from_env()?;
    if let Some(policy) = args.unknown_params {
        options.unknown_params = policy;
    }

    let store = args.store_dir.clone().map(FsPresetStore::new);

    let base = if let Some(path) = args.preset.as_deref() {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read preset {}: {e}", path.display()))?;
        info!(bytes = bytes.len(), "read preset {}", path.display());
        Some(decode_preset(&bytes)?)
    } else if let (Some(id), Some(store)) = (args.preset_id.as_deref(), store.as_ref()) {
        let doc = fetch_preset(store, id).await?;
        info!(preset_id = id, "fetched preset from store");
        Some(doc)
    } else {
        None
    };

    if let Some(path) = args.patch_file.as_deref() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read patch file {}: {e}", path.display()))?;
        let raw: Value = serde_json::from_str(&text)?;
        info!("read patch file {}", path.display());
        let changes = match raw.get("changes") {
            Some(Value::Object(m)) => m.clone(),
            _ => raw
                .as_object()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("patch file must contain a JSON object"))?,
        };

        let base = base.unwrap_or_default();
        let outcome = patch_document(&base, &changes, &registry, options.unknown_params);

        print_qc(changes.len(), &outcome.diff, &outcome.diagnostics);
        write_preset(&args, store.as_ref(), &outcome.document).await?;
        return Ok(());
    }

    let description = if let Some(d) = args.description.clone() {
        d
    } else {
        let path = args
            .description_file
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing --description or --description-file"))?;
        std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("failed to read description file {}: {e}", path.display())
        })?
    };

    let mut pipeline =
        PatchPipeline::new(Arc::clone(&registry), ProviderSet::from_env()?).with_options(options);
    let renderer = match args.render_url.as_deref() {
        Some(url) => Some(ConverterRenderer::new(url, Duration::from_secs(60))?),
        None => ConverterRenderer::from_env()?,
    };
    if let Some(r) = renderer {
        pipeline = pipeline.with_renderer(Arc::new(r));
    }

    let generated = pipeline
        .generate_detailed(&description, base, args.provider.as_deref(), args.skip_render)
        .await?;
    let resp = &generated.response;

    eprintln!("\nexplanation:\n{}\n", resp.explanation);
    print_qc(generated.proposed, &resp.diff, &generated.diagnostics);

    write_audio(&args, resp)?;
    write_preset(&args, store.as_ref(), &resp.modified_preset).await?;
    Ok(())
}

async fn write_preset(
    args: &Args,
    store: Option<&FsPresetStore>,
    doc: &PresetDocument,
) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(doc)?;

    if let (Some(id), Some(store)) = (args.save_as.as_deref(), store) {
        let key = object_key_for(id)?;
        store.store(&key, json.clone().into_bytes()).await?;
        info!("saved preset to store as {key}");
    }

    match args.out.as_deref() {
        Some(path) => {
            std::fs::write(path, &json)
                .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
            info!("wrote preset {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn write_audio(args: &Args, resp: &GenerateResponse) -> anyhow::Result<()> {
    let Some(path) = args.wav.as_deref() else {
        return Ok(());
    };
    match resp.audio.as_deref() {
        Some(b64) => {
            let wav = base64::engine::general_purpose::STANDARD.decode(b64)?;
            std::fs::write(path, &wav)?;
            info!(bytes = wav.len(), "wrote preview {}", path.display());
        }
        None => warn!("no audio rendered (renderer unavailable, failed or skipped)"),
    }
    Ok(())
}

fn print_qc(proposed: usize, diff: &[DiffItem], diagnostics: &[CoercionDiagnostic]) {
    for line in qc_lines(proposed, diff, diagnostics) {
        eprintln!("{line}");
    }
}

/// `proposed` counts entries before coercion, so `changed + dropped` may be lower
/// when a proposal repeats a value the preset already has.
fn qc_lines(proposed: usize, diff: &[DiffItem], diagnostics: &[CoercionDiagnostic]) -> Vec<String> {
    let mut lines = vec![
        "qc:".to_string(),
        format!("  proposed: {proposed}"),
        format!("  changed: {}", diff.len()),
    ];
    if !diagnostics.is_empty() {
        lines.push(format!("  dropped: {}", diagnostics.len()));
        lines.extend(diagnostics.iter().map(|d| format!("    - {d}")));
    }

    let mut groups: BTreeMap<String, Vec<&DiffItem>> = BTreeMap::new();
    for item in diff {
        groups.entry(group_key(&item.key)).or_default().push(item);
    }
    for (g, items) in groups {
        lines.push(format!("    [{g}]"));
        for item in items {
            lines.push(match item.old_value {
                Some(old) => format!("      {:<32} {:>10.3} -> {:.3}", item.key, old, item.new_value),
                None => format!("      {:<32} {:>10} -> {:.3}", item.key, "(unset)", item.new_value),
            });
        }
    }
    lines
}

/// `osc_1_level` -> `osc_1`, `reverb_dry_wet` -> `reverb`, `volume` -> `global`.
fn group_key(key: &str) -> String {
    let mut parts = key.split('_');
    let first = parts.next().unwrap_or(key);
    match parts.next() {
        None => "global".to_string(),
        Some(n) if n.chars().all(|c| c.is_ascii_digit()) => format!("{first}_{n}"),
        Some(_) => first.to_string(),
    }
}
