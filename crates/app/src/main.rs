use classwatch::{config::MonitorConfig, telemetry};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = MonitorConfig::from_args(&args)?;
    telemetry::init_tracing(config.verbose);
    launch(config)
}

#[cfg(feature = "with-tch")]
fn launch(config: MonitorConfig) -> anyhow::Result<()> {
    use tracker_core::{tch::Device, TorchTracker};

    let class_names = config.class_names()?;
    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    tracing::info!("tracker device: {device:?}");

    let model_path = config.model_path.clone();
    let input_size = (config.detector_width, config.detector_height);
    let (confidence, iou) = (config.conf_threshold, config.iou_threshold);
    classwatch::pipeline::run(config, move || {
        TorchTracker::new(&model_path, device, input_size, class_names)
            .map(|tracker| tracker.with_thresholds(confidence, iou))
    })
}

#[cfg(not(feature = "with-tch"))]
fn launch(_config: MonitorConfig) -> anyhow::Result<()> {
    anyhow::bail!("this build has no detector backend; rebuild with --features with-tch")
}
