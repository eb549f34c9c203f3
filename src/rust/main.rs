use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger;
use glimpse::{
    BuiltinModel, Classifier, ClassifierOptions, ExtractorConfig, Image, ModelManager,
    RankedPrediction,
};
use log::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Force a fresh download of the model files
    #[arg(short, long)]
    fresh: bool,

    /// Use a local ONNX model instead of the built-in MobileNetV2
    #[arg(long)]
    model: Option<PathBuf>,

    /// Number of ranked classes to print per image
    #[arg(short = 'k', long, default_value_t = 5)]
    top_k: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rank images against the ImageNet vocabulary
    Classify {
        /// Images to classify
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Train a head on folders of examples (one folder per class, in order)
    /// and rank the query images with it
    Train {
        /// Folder of example images; repeat once per class
        #[arg(long = "class", required = true)]
        classes: Vec<PathBuf>,

        /// Images to rank after training
        #[arg(long)]
        predict: Vec<PathBuf>,

        #[arg(long, default_value_t = 20)]
        epochs: usize,

        #[arg(long, default_value_t = 1e-4)]
        learning_rate: f32,
    },
}

async fn ensure_model_downloaded(fresh: bool) -> Result<()> {
    let manager = ModelManager::new_default()?;
    let info = BuiltinModel::MobileNetV2.get_model_info();

    if fresh {
        info!("Fresh download requested - removing any existing model files...");
        manager.remove_download(&info.name)?;
    }
    manager
        .ensure_model_downloaded(&info)
        .await
        .context("failed to download the built-in model")?;
    Ok(())
}

fn build_classifier(args: &Args, options: ClassifierOptions) -> Result<Classifier> {
    let builder = Classifier::builder().with_options(options);
    let builder = match &args.model {
        Some(path) => builder.with_custom_model(&path.to_string_lossy(), ExtractorConfig::default())?,
        None => builder.with_model(BuiltinModel::MobileNetV2)?,
    };
    Ok(builder.on_ready(|| info!("Feature extractor ready")).build()?)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("cannot read class folder {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn print_ranking(path: &Path, ranked: &[RankedPrediction]) {
    println!("\n{}", path.display());
    for prediction in ranked {
        println!("  {:>6.2}%  {}", prediction.probability * 100.0, prediction.class_name);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("=== Starting Image Classifier Demo ===");
    if args.model.is_none() {
        ensure_model_downloaded(args.fresh).await?;
    }

    let start_time = Instant::now();
    match &args.command {
        Command::Classify { images } => {
            let classifier = build_classifier(&args, ClassifierOptions::default())?;
            // Queue everything up front; results arrive once the model is loaded.
            let mut pending = Vec::new();
            for path in images {
                let image = Image::open(path).with_context(|| format!("cannot open {}", path.display()))?;
                pending.push((path, classifier.predict(image, Some(args.top_k))));
            }
            for (path, prediction) in pending {
                print_ranking(path, &prediction.await?);
            }
        }
        Command::Train {
            classes,
            predict,
            epochs,
            learning_rate,
        } => {
            let options = ClassifierOptions {
                num_classes: classes.len(),
                class_names: Some(
                    classes
                        .iter()
                        .map(|dir| dir.file_name().unwrap_or(dir.as_os_str()).to_string_lossy().into_owned())
                        .collect(),
                ),
                epochs: *epochs,
                learning_rate: *learning_rate,
                ..ClassifierOptions::default()
            };
            let classifier = build_classifier(&args, options)?;
            classifier.wait_ready().await?;

            for (label, dir) in classes.iter().enumerate() {
                let files = image_files(dir)?;
                if files.is_empty() {
                    bail!("class folder {} contains no images", dir.display());
                }
                for file in &files {
                    let image = Image::open(file).with_context(|| format!("cannot open {}", file.display()))?;
                    classifier.add_image(label, image)?;
                }
                info!("Added {} examples for class {}", files.len(), label);
            }

            let summary = classifier
                .train(|loss| println!("loss: {:.5}", loss))
                .await?;
            info!(
                "Trained on {} examples in {} batches (final loss {})",
                summary.examples, summary.batches, summary.final_loss
            );

            for path in predict {
                let image = Image::open(path).with_context(|| format!("cannot open {}", path.display()))?;
                let ranked = classifier.predict(image, Some(args.top_k)).await?;
                print_ranking(path, &ranked);
            }
        }
    }

    info!("=== Demo Complete ({:.2?}) ===", start_time.elapsed());
    Ok(())
}
