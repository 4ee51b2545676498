use argh::FromArgs;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use kornia_yolo::head::{DetectionHead, HeadConfig, HeadMode, HeadOutput, HeadVariant};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Build a detection head, run the stride dry-run and one forward pass per mode.
struct Args {
    /// path to a JSON head configuration
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// input image size in pixels
    #[argh(option, short = 's', default = "640")]
    size: usize,

    /// export format tag used for the export pass
    #[argh(option, short = 'f', default = "String::from(\"tflite\")")]
    format: String,

    /// batch size
    #[argh(option, short = 'b', default = "1")]
    batch: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = match &args.config {
        Some(path) => HeadConfig::from_json_file(path)?,
        None => HeadConfig::new(HeadVariant::NDetect, 80, vec![64, 128, 256]),
    };
    log::info!("head config: {config:?}");

    // random weights: the demo only exercises the head protocol
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut head = DetectionHead::new(config.clone(), vb)?;

    // a pyramid halving the resolution at every scale, starting at stride 8
    let features = config
        .ch
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let side = (args.size >> (3 + i)).max(1);
            Tensor::randn(0f32, 1f32, (args.batch, c, side, side), &device)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let strides = head.infer_strides((args.size, args.size), &features)?;
    println!("strides: {strides:?}");
    head.bias_init()?;

    let modes = [
        HeadMode::Training,
        HeadMode::Inference,
        HeadMode::from_flags(false, true, &args.format),
    ];
    for mode in modes {
        head.set_mode(mode.clone());
        let now = std::time::Instant::now();
        let output = head.forward(&features)?;
        let elapsed = now.elapsed();

        match &output {
            HeadOutput::Training(raw) => {
                let shapes = raw.iter().map(|t| t.dims().to_vec()).collect::<Vec<_>>();
                println!("{mode:?}: raw {shapes:?} in {elapsed:?}");
            }
            HeadOutput::Inference { prediction, raw } => {
                println!(
                    "{mode:?}: prediction {:?} + {} raw maps in {elapsed:?}",
                    prediction.dims(),
                    raw.len()
                );
            }
            HeadOutput::Export(prediction) => {
                println!("{mode:?}: prediction {:?} in {elapsed:?}", prediction.dims());
            }
        }
    }

    println!(
        "anchors rebuilt {} time(s)",
        head.anchor_cache().recompute_count()
    );

    if config.variant.is_auxiliary() {
        let mut pruned = head.prune_auxiliary();
        pruned.set_mode(HeadMode::Inference);
        let output = pruned.forward(&features)?;
        if let Some(prediction) = output.prediction() {
            println!("pruned: prediction {:?}", prediction.dims());
        }
    }

    Ok(())
}
