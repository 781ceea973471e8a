use crate::cli::ModesArgs;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use xcorr_core::{OperatingMode, ReductionFlags, Scope, SessionMode};

#[derive(Serialize)]
struct ModeInfo {
    name: &'static str,
    description: &'static str,
    scope: Scope,
    batch_scan: bool,
    log: bool,
    inverse: bool,
}

fn supports(base: OperatingMode, flags: ReductionFlags) -> bool {
    SessionMode::new(base, flags).is_ok()
}

pub fn execute(args: ModesArgs) -> i32 {
    let modes: Vec<ModeInfo> = OperatingMode::ALL
        .iter()
        .map(|base| ModeInfo {
            name: base.as_str(),
            description: base.description(),
            scope: base.scope(),
            batch_scan: *base != OperatingMode::Counter,
            log: supports(*base, ReductionFlags { log: true, ..Default::default() }),
            inverse: supports(*base, ReductionFlags { inverse: true, ..Default::default() }),
        })
        .collect();

    if args.json {
        if !output::print_json(&modes, false, None) {
            return exit_codes::EXECUTION_ERROR;
        }
        return exit_codes::SUCCESS;
    }

    println!("Operating modes:\n");
    println!(
        "  {:<16} {:<10} {:<6} {:<5} {:<8} {}",
        "Mode", "Channels", "Scan", "Log", "Inverse", "Description"
    );
    println!("  {}", "-".repeat(80));
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    for m in &modes {
        let channels = match m.scope {
            Scope::Line => "lines",
            Scope::Baseline => "baselines",
        };
        println!(
            "  {:<16} {:<10} {:<6} {:<5} {:<8} {}",
            m.name,
            channels,
            yes_no(m.batch_scan),
            yes_no(m.log),
            yes_no(m.inverse),
            m.description
        );
    }
    println!();
    println!("Correlator modes scan on the device unless --live is given.");
    println!("Example: xcorr run --mode auto --live --log --stack 10");

    exit_codes::SUCCESS
}
