use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use cqr_common::{
    collate, convert_canard, convert::parse_canard, CollatedBatch, DialogRecord, ModelConfig,
    RewriteDataset, RewriteTokenizer, TaskDirection,
};
use cqr_infer::{predict_with_model, DecodeOptions, Rewriter};
use cqr_train::{Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "cqr", about = "Conversational query rewriting: convert, train, rewrite")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert the CANARD JSON release into dialog-rewrite JSONL.
    Convert(ConvertArgs),
    /// Train a rewrite model from converted JSONL data.
    Train(TrainArgs),
    /// Rewrite queries with a trained model directory.
    Rewrite(RewriteArgs),
}

// ── Convert ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// CANARD release file (one JSON array of annotated turns).
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Learn "rewrite" (question → self-contained form) or "simplify" (the reverse).
    #[arg(long, default_value = "rewrite", value_parser = ["rewrite", "simplify"])]
    direction: String,
    /// Attach 0/1 needs-rewrite flags for multi-task training.
    #[arg(long)]
    mtl: bool,
}

// ── Train ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Converted training data (JSONL).
    #[arg(long)]
    train_file: PathBuf,
    #[arg(long)]
    valid_file: Option<PathBuf>,
    #[arg(long)]
    tokenizer: PathBuf,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    /// Override the block length from the model config.
    #[arg(long)]
    block_size: Option<usize>,
    /// Train the needs-rewrite head alongside the LM.
    #[arg(long)]
    mtl: bool,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    /// Micro-batches per optimiser step; effective batch = batch_size * this.
    #[arg(long, default_value_t = 1)]
    accumulation_steps: usize,
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    /// 0 = bounded by epochs only.
    #[arg(long, default_value_t = 0)]
    max_steps: usize,
    #[arg(long, default_value = "5e-5")]
    lr: f64,
    #[arg(long, default_value_t = 0)]
    warmup_steps: usize,
    #[arg(long, default_value = "0.0")]
    weight_decay: f64,
    #[arg(long, default_value = "1e-8")]
    adam_epsilon: f64,
    #[arg(long, default_value = "1.0")]
    max_grad_norm: f64,
    /// Multiplier on the LM loss in the combined multi-task objective.
    #[arg(long, default_value = "10.0")]
    lm_loss_weight: f64,
    #[arg(long, default_value_t = 50)]
    save_steps: usize,
    #[arg(long, default_value_t = 10)]
    log_every: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Decode this many validation examples after each epoch (0 = off).
    #[arg(long, default_value_t = 0)]
    debug_samples: usize,
    #[arg(long, default_value_t = 20)]
    length: usize,
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,
    #[arg(long, default_value_t = 0.9)]
    top_p: f64,
}

// ── Rewrite ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct RewriteArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// JSONL of dialog records to rewrite; omit for an interactive session.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long, default_value_t = 20)]
    length: usize,
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,
    #[arg(long, default_value_t = 0.9)]
    top_p: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Convert(args) => cmd_convert(args),
        Command::Train(args) => cmd_train(args),
        Command::Rewrite(args) => cmd_rewrite(args),
    }
}

// ── Command implementations ─────────────────────────────────────────────────

fn cmd_convert(args: ConvertArgs) -> Result<()> {
    let json = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let turns = parse_canard(&json)?;
    let direction = TaskDirection::from_str(&args.direction);
    let records = convert_canard(&turns, direction, args.mtl);

    let mut out = std::io::BufWriter::new(
        File::create(&args.output).with_context(|| format!("create {}", args.output.display()))?,
    );
    for record in &records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    eprintln!(
        "Converted {} turns ({} dialogs) to {}",
        records.len(),
        records.last().map(|r| r.topic_number).unwrap_or(0),
        args.output.display()
    );
    Ok(())
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut model_config = if args.config.exists() {
        ModelConfig::load(&args.config)?
    } else {
        let default = ModelConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(block_size) = args.block_size {
        model_config.block_size = block_size;
    }
    model_config.multitask = args.mtl;

    let tokenizer = RewriteTokenizer::from_file(&args.tokenizer, args.mtl)?;
    model_config.vocab_size = tokenizer.vocab_size();
    let special = *tokenizer.special();

    let train_ds = RewriteDataset::load(
        &[&args.train_file],
        &tokenizer,
        &special,
        model_config.block_size,
        args.mtl,
    )?;
    if train_ds.is_empty() {
        anyhow::bail!("no training examples in {}", args.train_file.display());
    }
    eprintln!("Training examples: {}", train_ds.len());

    let valid_ds = match &args.valid_file {
        Some(path) => {
            let ds = RewriteDataset::load(
                &[path],
                &tokenizer,
                &special,
                model_config.block_size,
                args.mtl,
            )?;
            eprintln!("Validation examples: {}", ds.len());
            Some(ds)
        }
        None => None,
    };
    let debug_records = match (&args.valid_file, args.debug_samples) {
        (Some(path), n) if n > 0 => read_records(path, n)?,
        _ => Vec::new(),
    };

    let device = Device::cuda_if_available(0)?;
    let accumulation_steps = args.accumulation_steps.max(1);
    let micro_per_epoch = train_ds.len().div_ceil(args.batch_size.max(1));
    let steps_per_epoch = micro_per_epoch.div_ceil(accumulation_steps);
    let total_steps = if args.max_steps > 0 {
        args.max_steps
    } else {
        args.epochs * steps_per_epoch
    };

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        accumulation_steps,
        num_epochs: args.epochs,
        max_steps: args.max_steps,
        lr: args.lr,
        warmup_steps: args.warmup_steps,
        weight_decay: args.weight_decay,
        adam_epsilon: args.adam_epsilon,
        max_grad_norm: args.max_grad_norm,
        lm_loss_weight: args.lm_loss_weight,
        save_steps: args.save_steps,
        output_dir: args.output_dir.clone(),
    };
    let mut trainer = Trainer::new(model_config.clone(), trainer_config, total_steps, device)?;

    let decode_options = DecodeOptions {
        max_new_tokens: args.length.min(model_config.block_size),
        temperature: args.temperature,
        top_p: args.top_p,
    };
    let mut shuffle_rng = StdRng::seed_from_u64(args.seed);
    let mut decode_rng = StdRng::seed_from_u64(args.seed);
    let mut train_ds = train_ds;

    'epochs: for epoch in 0..args.epochs {
        train_ds.shuffle(&mut shuffle_rng);

        let pb = ProgressBar::new(steps_per_epoch as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        let mut acc: Vec<CollatedBatch> = Vec::with_capacity(accumulation_steps);
        for examples in train_ds.batches(args.batch_size) {
            if args.max_steps > 0 && trainer.global_step >= args.max_steps {
                pb.finish_and_clear();
                break 'epochs;
            }
            acc.push(collate(examples, special.cls, trainer.device())?);
            if acc.len() < accumulation_steps {
                continue;
            }
            let m = trainer.step(&acc)?;
            acc.clear();
            pb.set_message(format!("loss {:.4}", m.loss));
            pb.inc(1);

            if args.log_every > 0 && m.step % args.log_every == 0 {
                match m.mc_loss {
                    Some(mc) => eprintln!(
                        "step {} epoch {epoch} loss {:.4} (lm {:.4} mc {:.4}) lr {:.2e}",
                        m.step, m.loss, m.lm_loss, mc, m.lr
                    ),
                    None => eprintln!(
                        "step {} epoch {epoch} loss {:.4} lr {:.2e}",
                        m.step, m.loss, m.lr
                    ),
                }
            }
            if args.save_steps > 0
                && trainer.global_step > 0
                && trainer.global_step % args.save_steps == 0
            {
                let path = trainer.save_checkpoint()?;
                eprintln!("  Saved checkpoint to {}", path.display());
            }
        }
        // Short tail of the epoch still gets its update.
        if !acc.is_empty() {
            let m = trainer.step(&acc)?;
            acc.clear();
            pb.set_message(format!("loss {:.4}", m.loss));
            pb.inc(1);
        }
        pb.finish_and_clear();

        if let Some(ref valid_ds) = valid_ds {
            let batches = valid_ds
                .batches(args.batch_size)
                .map(|ex| collate(ex, special.cls, trainer.device()))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let metrics = trainer.evaluate(&batches)?;
            match metrics.mc_accuracy {
                Some(acc) => eprintln!(
                    "  [eval] epoch {epoch} val_loss={:.4} needs_rewrite_acc={acc:.3}",
                    metrics.loss
                ),
                None => eprintln!("  [eval] epoch {epoch} val_loss={:.4}", metrics.loss),
            }
        }

        for record in &debug_records {
            let prediction = predict_with_model(
                trainer.model(),
                &tokenizer,
                &record.input,
                &decode_options,
                args.mtl,
                trainer.device(),
                &mut decode_rng,
            )?;
            let source = record.input.last().map(String::as_str).unwrap_or("");
            eprintln!("  [decode] {source:?} -> {prediction:?}");
        }
    }

    let path = trainer.save_final()?;
    tokenizer.save(&args.output_dir.join("tokenizer.json"))?;
    eprintln!("Training done. Saved to {}", path.display());
    Ok(())
}

fn cmd_rewrite(args: RewriteArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let options = DecodeOptions {
        max_new_tokens: args.length,
        temperature: args.temperature,
        top_p: args.top_p,
    };

    eprintln!("Loading model from {} ...", args.model_dir.display());
    let mut rewriter = Rewriter::load(&args.model_dir, options, args.seed, device)?;

    match args.input {
        Some(path) => {
            // Header-less batch mode: one prediction line per input record.
            let records = read_records(&path, usize::MAX)?;
            for record in &records {
                let prediction = rewriter.predict(&record.input)?;
                println!(
                    "{}",
                    serde_json::json!({
                        "topic_number": record.topic_number,
                        "query_number": record.query_number,
                        "prediction": prediction,
                    })
                );
            }
            eprintln!("Rewrote {} records", records.len());
        }
        None => interactive_loop(&mut rewriter)?,
    }
    Ok(())
}

/// Accumulate a turn history from stdin; an empty line starts a new
/// conversation and 'quit' exits.
fn interactive_loop(rewriter: &mut Rewriter) -> Result<()> {
    eprintln!("Ready. Empty line resets the conversation, 'quit' exits.\n");
    let stdin = std::io::stdin();
    let mut history: Vec<String> = Vec::new();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line == "quit" {
            break;
        }
        if line.is_empty() {
            history.clear();
            eprintln!("(new conversation)");
            continue;
        }
        history.push(line.to_string());
        let prediction = rewriter.predict(&history)?;
        println!("{prediction}");
    }
    Ok(())
}

fn read_records(path: &std::path::Path, limit: usize) -> Result<Vec<DialogRecord>> {
    let reader =
        BufReader::new(File::open(path).with_context(|| format!("open {}", path.display()))?);
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        if records.len() >= limit {
            break;
        }
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: DialogRecord = serde_json::from_str(line)
            .with_context(|| format!("parse {}:{}", path.display(), line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}
