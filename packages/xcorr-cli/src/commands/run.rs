use crate::cli::RunArgs;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use xcorr_core::{
    AxisRange, CallbackSink, DeviceConfig, DeviceGeometry, LineFlags, NullSink, Pipeline,
    PipelineConfig, PipelineStats, ReductionFlags, Scope, SeriesKind, SessionMode, Sink,
    TimeScale, XcError, XcResult,
};

#[derive(Serialize)]
struct SeriesSummary {
    channel: usize,
    kind: SeriesKind,
    points: usize,
    revision: u64,
    mean: Option<f64>,
    x_range: Option<(f64, f64)>,
}

#[derive(Serialize)]
struct RunSummary {
    session_id: Option<String>,
    mode: SessionMode,
    geometry: DeviceGeometry,
    time_scale: Option<TimeScale>,
    stack: usize,
    axis: Option<AxisRange>,
    stats: PipelineStats,
    series: Vec<SeriesSummary>,
}

/// Pipeline configuration from the optional file, with command-line overrides applied
fn build_config(args: &RunArgs) -> XcResult<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(Path::new(path))?,
        None => PipelineConfig::default(),
    };
    if let Some(stack) = args.stack {
        config.stack = stack;
    }
    if let Some(interval) = args.publish_interval_ms {
        config.publish_interval_ms = interval;
    }
    if let Some(k) = args.time_scale {
        config.time_scale = TimeScale::new(k)?;
    }
    config.validate()?;
    Ok(config)
}

/// Merge the power switches given on the command line, one entry per line
fn line_flags(low_power: &[usize], high_power: &[usize]) -> BTreeMap<usize, LineFlags> {
    let mut lines: BTreeMap<usize, LineFlags> = BTreeMap::new();
    for line in low_power {
        lines.entry(*line).or_default().low_power = true;
    }
    for line in high_power {
        lines.entry(*line).or_default().high_power = true;
    }
    lines
}

/// Sink printing every event as one compact JSON line
fn streaming_sink() -> Arc<dyn Sink> {
    Arc::new(CallbackSink::new(|event| match serde_json::to_string(&event) {
        Ok(line) => {
            if let Err(e) = output::write_line(&line) {
                log::warn!("{}", e);
            }
        }
        Err(e) => log::warn!("Failed to serialize event: {}", e),
    }))
}

/// Wait for `duration` or Ctrl-C; returns false when interrupted
async fn capture_for(duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = tokio::signal::ctrl_c() => false,
    }
}

fn summarize(pipeline: &Pipeline, mode: SessionMode, geometry: DeviceGeometry) -> RunSummary {
    let channels = match mode.scope() {
        Scope::Line => geometry.num_lines,
        Scope::Baseline => geometry.num_baselines,
    };
    let mut series = Vec::new();
    for channel in 0..channels {
        for kind in mode.kinds() {
            let snapshot = pipeline.series(channel, kind);
            series.push(SeriesSummary {
                channel,
                kind,
                points: snapshot.len(),
                revision: pipeline.revision(channel, kind),
                mean: snapshot.mean(),
                x_range: snapshot.x_range(),
            });
        }
    }

    RunSummary {
        session_id: pipeline.session_id().map(str::to_string),
        mode,
        geometry,
        time_scale: pipeline.time_scale(),
        stack: pipeline.stack(),
        axis: pipeline.axis_range(),
        stats: pipeline.stats(),
        series,
    }
}

async fn run_session(args: &RunArgs, pipeline: &mut Pipeline, mode: SessionMode) -> XcResult<RunSummary> {
    pipeline.set_mode(mode).await?;
    let geometry = pipeline.connect(&args.endpoint).await?;

    for (line, flags) in line_flags(&args.low_power, &args.high_power) {
        pipeline.set_line(line, flags).await?;
    }
    if let Some(rate) = args.baud {
        pipeline.set_baud_rate(rate).await?;
    }

    if !args.quiet {
        eprintln!(
            "Capturing {} for {} ms on {}...",
            mode, args.duration_ms, args.endpoint
        );
    }
    pipeline.enable_capture().await?;

    let duration = Duration::from_millis(args.duration_ms);
    let completed = if args.dark.is_empty() {
        capture_for(duration).await
    } else {
        let half = duration / 2;
        if capture_for(half).await {
            for channel in &args.dark {
                pipeline.capture_dark(*channel).await?;
            }
            capture_for(duration - half).await
        } else {
            false
        }
    };
    if !completed && !args.quiet {
        eprintln!("Interrupted, stopping capture");
    }

    if pipeline.state().is_connected() {
        pipeline.disable_capture().await?;
    } else {
        return Err(XcError::DeviceUnavailable(
            "correlator disconnected during capture".to_string(),
        ));
    }
    let summary = summarize(pipeline, mode, geometry);
    pipeline.disconnect().await?;
    Ok(summary)
}

pub async fn execute(args: RunArgs) -> i32 {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    let flags = ReductionFlags {
        live: args.live,
        log: args.log,
        inverse: args.inverse,
    };
    let mode = match SessionMode::new(args.mode, flags) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let sink: Arc<dyn Sink> = if args.summary {
        Arc::new(NullSink)
    } else {
        streaming_sink()
    };
    let device = DeviceConfig::Simulated(args.device.profile());
    let mut pipeline = match Pipeline::from_device_config(config, device, sink) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    let summary = match run_session(&args, &mut pipeline, mode).await {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Capture failed: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    if args.summary {
        if !output::print_json(&summary, args.compact, args.output.as_deref()) {
            return exit_codes::EXECUTION_ERROR;
        }
        if !args.quiet {
            if let Some(ref path) = args.output {
                eprintln!("Summary written to {}", path);
            }
        }
    } else if !args.quiet {
        eprintln!(
            "Delivered {} updates, dropped {}",
            summary.stats.updates_delivered, summary.stats.updates_dropped
        );
    }

    exit_codes::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::DeviceArgs;
    use std::io::Write;
    use xcorr_core::OperatingMode;

    fn make_test_args() -> RunArgs {
        RunArgs {
            device: DeviceArgs {
                lines: 4,
                delay_size: 16,
                spectra_jitter: 8,
                correlator_jitter: 4,
                clock: 400_000_000.0,
                packet_period: 0.005,
                scan_pass_ms: 1,
                seed: Some(3),
            },
            endpoint: "sim0".to_string(),
            mode: OperatingMode::Counter,
            live: false,
            log: false,
            inverse: false,
            time_scale: None,
            stack: None,
            duration_ms: 100,
            publish_interval_ms: None,
            config: None,
            low_power: vec![],
            high_power: vec![],
            baud: None,
            dark: vec![],
            summary: true,
            output: None,
            compact: true,
            quiet: true,
        }
    }

    #[test]
    fn test_config_overrides() {
        let mut args = make_test_args();
        args.stack = Some(5);
        args.time_scale = Some(3);
        let config = build_config(&args).unwrap();
        assert_eq!(config.stack, 5);
        assert_eq!(config.time_scale.exponent(), 3);
        assert_eq!(config.publish_interval_ms, PipelineConfig::default().publish_interval_ms);
    }

    #[test]
    fn test_config_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"stack": 8, "publish_interval_ms": 250}}"#).unwrap();
        let mut args = make_test_args();
        args.config = Some(file.path().to_str().unwrap().to_string());
        args.publish_interval_ms = Some(50);
        let config = build_config(&args).unwrap();
        assert_eq!(config.stack, 8);
        assert_eq!(config.publish_interval_ms, 50);
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let mut args = make_test_args();
        args.time_scale = Some(64);
        assert!(matches!(build_config(&args), Err(XcError::Configuration(_))));

        let mut args = make_test_args();
        args.stack = Some(0);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_line_flags_merge() {
        let lines = line_flags(&[0, 2], &[2]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[&0].bits(), 0b01);
        assert_eq!(lines[&2].bits(), 0b11);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_session_summarizes_counter_run() {
        let mut args = make_test_args();
        args.publish_interval_ms = Some(20);
        args.low_power = vec![1];
        let config = build_config(&args).unwrap();
        let mut pipeline = Pipeline::from_device_config(
            config,
            DeviceConfig::Simulated(args.device.profile()),
            Arc::new(NullSink),
        )
        .unwrap();

        let summary = run_session(&args, &mut pipeline, SessionMode::counter())
            .await
            .unwrap();
        assert_eq!(summary.series.len(), 4);
        assert!(summary.stats.frames_captured > 0);
        assert!(summary.session_id.is_some());
        assert!(summary.series.iter().all(|s| s.kind == SeriesKind::Plain));
    }
}
