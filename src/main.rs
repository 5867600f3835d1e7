use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use eegdaq::cleaner::{DEFAULT_THRESHOLD, DEFAULT_WINDOW};
use eegdaq::{
    init_logging, interpolate_flagged, load_csv_recording, suppress_outliers,
    AcquisitionController, CsvDataset, CsvDatasetFactory, DaqDevice, ProcessPresenter, SampleBus,
    SerialLink, SessionConfig, AUTO_LINK, DAQ_STREAM_NAME,
};

#[derive(Parser, Debug)]
#[command(name = "eegdaq", about = "Configure, record and clean EEG acquisition sessions")]
struct Args {
    /// Log level (overrides EEGDAQ_LOG / RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Configure the board and record one session to CSV
    Acquire {
        /// Session file (TOML); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Serial port, overrides the session file
        #[arg(long)]
        link: Option<String>,
        /// Recording length in seconds, overrides the session file
        #[arg(short, long)]
        duration: Option<u64>,
        /// Directory for the recording
        #[arg(short, long, default_value = "recordings")]
        output: PathBuf,
        /// Live viewer to run next to the acquisition (program and arguments).
        /// Samples arrive on its stdin as one JSON object per line
        #[arg(long, num_args = 1.., value_name = "CMD")]
        presenter: Vec<String>,
    },
    /// Query firmware, clock, runtime, state and error registers
    Status {
        /// Serial port (AUTOCOM to auto-detect)
        #[arg(long, default_value = AUTO_LINK)]
        link: String,
        /// Reset the board before querying
        #[arg(long)]
        reset: bool,
    },
    /// Interpolate flagged samples and suppress outliers in a CSV recording
    Clean {
        input: PathBuf,
        /// Defaults to `<input>_cleaned.csv`; an existing file is not replaced
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Rolling median window (odd)
        #[arg(long, default_value_t = DEFAULT_WINDOW)]
        window: usize,
        /// Maximum deviation from the rolling median
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: i64,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    match args.command {
        Cmd::Acquire {
            config,
            link,
            duration,
            output,
            presenter,
        } => acquire(config.as_deref(), link, duration, output, presenter),
        Cmd::Status { link, reset } => status(&link, reset),
        Cmd::Clean {
            input,
            output,
            window,
            threshold,
        } => clean(&input, output, window, threshold),
    }
}

fn acquire(
    config: Option<&Path>,
    link: Option<String>,
    duration: Option<u64>,
    output: PathBuf,
    presenter: Vec<String>,
) -> Result<()> {
    let mut session = match config {
        Some(path) => SessionConfig::from_toml_file(path)
            .with_context(|| format!("loading session file {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(link) = link {
        session.device.link = link;
    }
    if let Some(duration) = duration {
        session.device.measure_duration_s = duration;
    }
    let duration = Duration::from_secs(session.device.measure_duration_s);

    let serial = SerialLink::open(&session.device.link)
        .with_context(|| format!("opening link {}", session.device.link))?;
    let mut controller = AcquisitionController::new(
        DaqDevice::new(Box::new(serial)),
        session.device,
        session.metadata,
        Arc::new(SampleBus::new(DAQ_STREAM_NAME)),
        Box::new(CsvDatasetFactory::new(&output)),
    )
    .context("configuring the board")?;

    if let Some((program, rest)) = presenter.split_first() {
        controller = controller.with_presenter(Box::new(ProcessPresenter::new(
            program.clone(),
            rest.to_vec(),
        )));
    }

    info!("recording for {} s into {}", duration.as_secs(), output.display());
    let summary = controller.run_for(duration).context("acquisition failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn status(link: &str, reset: bool) -> Result<()> {
    let serial = SerialLink::open(link).with_context(|| format!("opening link {link}"))?;
    let mut device = DaqDevice::new(Box::new(serial));

    if reset {
        info!("resetting board");
        device.do_reset().context("reset")?;
    }

    println!("Firmware:      {}", device.get_firmware_version()?);
    println!("System clock:  {} kHz", device.get_system_clock_khz()?);
    println!("Runtime:       {:.3} s", device.get_runtime_sec()?);
    println!("System state:  {}", device.get_system_state()?);
    println!("Pin state:     {:?}", device.get_pin_state()?);

    let errors = device.error_register().context("reading error register")?;
    if errors.has_errors() {
        println!("Error register: {errors:#?}");
    } else {
        println!("Error register: clear");
    }
    Ok(())
}

fn clean(input: &Path, output: Option<PathBuf>, window: usize, threshold: i64) -> Result<()> {
    let recording = load_csv_recording(input)
        .with_context(|| format!("loading recording {}", input.display()))?;
    let Some(attributes) = recording.attributes else {
        bail!("{} has no attribute header", input.display());
    };
    let mut data = recording.data;

    let gaps = interpolate_flagged(&mut data.measurements, &data.alerts)?;
    let outliers = suppress_outliers(&mut data.measurements, window, threshold)?;
    info!(
        "{} flagged runs interpolated ({} samples), {} left at the edges, {} outliers replaced",
        gaps.interpolated_runs,
        gaps.interpolated_samples,
        gaps.unbounded.len(),
        outliers
    );

    let output = output.unwrap_or_else(|| cleaned_path(input));
    CsvDataset::write_recording(&output, &attributes, &data)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("{}", output.display());
    Ok(())
}

fn cleaned_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    input.with_file_name(format!("{stem}_cleaned.csv"))
}
