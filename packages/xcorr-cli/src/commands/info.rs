use crate::cli::InfoArgs;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use xcorr_core::{
    autocorrelation_len, axis_range, crosscorrelation_len, AxisRange, DeviceGeometry,
    OperatingMode, ReductionFlags, SessionMode, TimeScale,
};

#[derive(Serialize)]
struct BufferSizes {
    autocorrelation_len: usize,
    crosscorrelation_len: usize,
}

#[derive(Serialize)]
struct ModeAxis {
    mode: OperatingMode,
    #[serde(flatten)]
    axis: AxisRange,
}

#[derive(Serialize)]
struct InfoOutput {
    cli_version: String,
    geometry: DeviceGeometry,
    time_scale: TimeScale,
    sample_spacing_ns: f64,
    buffers: BufferSizes,
    live_autocorrelation_lags: usize,
    live_crosscorrelation_lags: usize,
    axes: Vec<ModeAxis>,
}

pub fn execute(args: InfoArgs) -> i32 {
    let geometry = args.device.profile().geometry();
    if let Err(e) = geometry.validate() {
        eprintln!("Error: {}", e);
        return exit_codes::for_error(&e);
    }
    let time_scale = match TimeScale::new(args.time_scale) {
        Ok(ts) => ts,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    let axes = OperatingMode::ALL
        .iter()
        .filter_map(|base| {
            let mode = SessionMode::new(*base, ReductionFlags::default()).ok()?;
            Some(ModeAxis {
                mode: *base,
                axis: axis_range(mode, &geometry, time_scale, 10.0),
            })
        })
        .collect();

    let info = InfoOutput {
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        geometry,
        time_scale,
        sample_spacing_ns: geometry.sample_spacing_ns(time_scale),
        buffers: BufferSizes {
            autocorrelation_len: autocorrelation_len(&geometry, time_scale),
            crosscorrelation_len: crosscorrelation_len(&geometry, time_scale),
        },
        live_autocorrelation_lags: geometry.live_autocorrelation_lags(),
        live_crosscorrelation_lags: geometry.live_crosscorrelation_lags(),
        axes,
    };

    if args.json {
        if !output::print_json(&info, false, None) {
            return exit_codes::EXECUTION_ERROR;
        }
        return exit_codes::SUCCESS;
    }

    println!("xcorr CLI v{}", info.cli_version);
    println!();
    println!(
        "Lines: {} ({} baselines)",
        geometry.num_lines, geometry.num_baselines
    );
    println!("Delay channels: {}", geometry.delay_size);
    println!(
        "Live lags: {} auto, {} cross",
        info.live_autocorrelation_lags, info.live_crosscorrelation_lags
    );
    println!("Clock: {} Hz, packet period {} s", geometry.clock_frequency, geometry.packet_period);
    println!(
        "Time scale {}: {} ns per bin",
        time_scale, info.sample_spacing_ns
    );
    println!(
        "Scan buffers: {} autocorrelation, {} crosscorrelation samples",
        info.buffers.autocorrelation_len, info.buffers.crosscorrelation_len
    );
    println!();
    for entry in &info.axes {
        println!(
            "  {:<16} {} [{}, {}]  {}",
            entry.mode.as_str(),
            entry.axis.x_label,
            entry.axis.x_min,
            entry.axis.x_max,
            entry.axis.y_label
        );
    }

    exit_codes::SUCCESS
}
