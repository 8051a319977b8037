use std::{fs, path::PathBuf};

use anyhow::{anyhow, bail, Context, Result};

/// Class names used when no label file is supplied; indices match the
/// exported behavior model.
pub const DEFAULT_CLASS_NAMES: [&str; 6] = [
    "LookingUp",
    "LookingDown",
    "LyingOnDesk",
    "LookingBack",
    "UsingPhone",
    "Standing",
];

const USAGE: &str = "Usage: classwatch [--source <uri>] [--model <path>] \
[--labels <path>] [--bind <addr>] [--jpeg-quality <1-100>] [--mjpeg-fps <n>] \
[--infer-interval <secs>] [--conf <0-1>] [--iou <0-1>] \
[--detector-width <px>] [--detector-height <px>] [--embed-image] [--cpu] \
[--verbose]\n\nPositional form is also supported: classwatch <source-uri> \
<model-path> [...flags...]";

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub source: String,
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub bind_addr: String,
    pub jpeg_quality: i32,
    pub mjpeg_fps: u32,
    pub infer_interval_secs: f64,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub detector_width: i64,
    pub detector_height: i64,
    pub embed_image: bool,
    pub use_cpu: bool,
    pub verbose: bool,
}

impl MonitorConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            bail!(USAGE);
        }

        let mut source: Option<String> = None;
        let mut model_path: Option<PathBuf> = None;
        let mut labels_path: Option<PathBuf> = None;
        let mut bind_addr: Option<String> = None;
        let mut jpeg_quality: Option<i32> = None;
        let mut mjpeg_fps: Option<u32> = None;
        let mut infer_interval_secs: Option<f64> = None;
        let mut conf_threshold: Option<f32> = None;
        let mut iou_threshold: Option<f32> = None;
        let mut detector_width: Option<i64> = None;
        let mut detector_height: Option<i64> = None;
        let mut embed_image = false;
        let mut use_cpu = false;
        let mut verbose = false;
        let mut positional: Vec<String> = Vec::new();

        let mut idx = 1;
        while idx < args.len() {
            match args[idx].as_str() {
                "--source" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--source requires a value"))?
                        .clone();
                    source = Some(value);
                    idx += 1;
                }
                "--model" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--model requires a value"))?
                        .clone();
                    model_path = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--labels" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--labels requires a value"))?
                        .clone();
                    labels_path = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--bind" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--bind requires a value"))?
                        .clone();
                    bind_addr = Some(value);
                    idx += 1;
                }
                "--jpeg-quality" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--jpeg-quality requires a value"))?
                        .parse::<i32>()
                        .with_context(|| {
                            "--jpeg-quality must be an integer between 1 and 100".to_string()
                        })?;
                    if !(1..=100).contains(&value) {
                        bail!("--jpeg-quality must be an integer between 1 and 100");
                    }
                    jpeg_quality = Some(value);
                    idx += 1;
                }
                "--mjpeg-fps" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--mjpeg-fps requires a value"))?
                        .parse::<u32>()
                        .with_context(|| "--mjpeg-fps must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--mjpeg-fps must be at least 1");
                    }
                    mjpeg_fps = Some(value);
                    idx += 1;
                }
                "--infer-interval" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--infer-interval requires a value"))?
                        .parse::<f64>()
                        .with_context(|| "--infer-interval must be a number of seconds".to_string())?;
                    if !(value > 0.0) {
                        bail!("--infer-interval must be greater than zero");
                    }
                    infer_interval_secs = Some(value);
                    idx += 1;
                }
                "--conf" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--conf requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--conf must be a number between 0 and 1".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--conf must be between 0 and 1");
                    }
                    conf_threshold = Some(value);
                    idx += 1;
                }
                "--iou" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--iou requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--iou must be a number between 0 and 1".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--iou must be between 0 and 1");
                    }
                    iou_threshold = Some(value);
                    idx += 1;
                }
                "--detector-width" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--detector-width requires a value"))?
                        .parse::<i64>()
                        .with_context(|| {
                            "--detector-width must be a positive integer".to_string()
                        })?;
                    if value <= 0 {
                        bail!("--detector-width must be a positive integer");
                    }
                    detector_width = Some(value);
                    idx += 1;
                }
                "--detector-height" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--detector-height requires a value"))?
                        .parse::<i64>()
                        .with_context(|| {
                            "--detector-height must be a positive integer".to_string()
                        })?;
                    if value <= 0 {
                        bail!("--detector-height must be a positive integer");
                    }
                    detector_height = Some(value);
                    idx += 1;
                }
                "--embed-image" => {
                    embed_image = true;
                    idx += 1;
                }
                "--cpu" => {
                    use_cpu = true;
                    idx += 1;
                }
                "--verbose" => {
                    verbose = true;
                    idx += 1;
                }
                arg if arg.starts_with('-') => {
                    bail!("Unrecognised flag: {arg}");
                }
                other => {
                    positional.push(other.to_string());
                    idx += 1;
                }
            }
        }

        let mut positional = positional.into_iter();
        if source.is_none() {
            source = positional.next();
        }
        if model_path.is_none() {
            if let Some(path) = positional.next() {
                model_path = Some(PathBuf::from(path));
            }
        }

        let source = source.ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <source-uri>.")
        })?;
        let model_path = model_path.ok_or_else(|| {
            anyhow!("Missing model path. Provide --model <path> or positional <model-path>.")
        })?;

        Ok(Self {
            source,
            model_path,
            labels_path,
            bind_addr: bind_addr.unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            jpeg_quality: jpeg_quality.unwrap_or(80),
            mjpeg_fps: mjpeg_fps.unwrap_or(20),
            infer_interval_secs: infer_interval_secs.unwrap_or(0.5),
            conf_threshold: conf_threshold.unwrap_or(0.25),
            iou_threshold: iou_threshold.unwrap_or(0.30),
            detector_width: detector_width.unwrap_or(640),
            detector_height: detector_height.unwrap_or(640),
            embed_image,
            use_cpu,
            verbose,
        })
    }

    /// Class names for the detector: the label file when given, one name per
    /// line, otherwise the built-in behavior classes.
    pub fn class_names(&self) -> Result<Vec<String>> {
        match &self.labels_path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read label file {}", path.display()))?;
                let names: Vec<String> = text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect();
                if names.is_empty() {
                    bail!("label file {} lists no classes", path.display());
                }
                Ok(names)
            }
            None => Ok(DEFAULT_CLASS_NAMES.iter().map(|name| name.to_string()).collect()),
        }
    }
}
