//! Operator scripts: named sequences of daemon commands.
//!
//! Scripts resolve through the config's `scripts_module` registry id and run
//! client-side, so a site can codify its start-of-night and end-of-night
//! procedures without touching the daemon.

use crate::client::DaemonClient;
use crate::error::CliError;
use nightops::command::CommandStatus;
use std::time::Duration;

/// How often the shutdown script polls for the dome to finish closing.
const DOME_CLOSE_POLL: Duration = Duration::from_secs(10);

/// Polls before the shutdown script gives up on the dome closing.
const DOME_CLOSE_ATTEMPTS: u32 = 60;

/// A runnable operator script.
pub struct Script {
    pub name: &'static str,
    pub description: &'static str,
    run: fn(&DaemonClient, &[String]) -> Result<(), CliError>,
}

impl Script {
    pub fn run(&self, client: &DaemonClient, args: &[String]) -> Result<(), CliError> {
        (self.run)(client, args)
    }
}

/// Scripts available in the `simulated` module.
const SIMULATED_SCRIPTS: &[Script] = &[
    Script {
        name: "startup",
        description: "switch dome and telescope to automatic control",
        run: run_startup,
    },
    Script {
        name: "shutdown",
        description: "stop observations and return everything to manual control",
        run: run_shutdown,
    },
];

/// Resolves a script by module id and name.
pub fn lookup_script(module: &str, name: &str) -> Option<&'static Script> {
    let scripts = match module {
        "simulated" => SIMULATED_SCRIPTS,
        _ => return None,
    };
    scripts.iter().find(|script| script.name == name)
}

/// Lists the script names available in a module.
pub fn script_names(module: &str) -> Vec<&'static str> {
    match module {
        "simulated" => SIMULATED_SCRIPTS.iter().map(|s| s.name).collect(),
        _ => Vec::new(),
    }
}

fn expect_no_args(args: &[String]) -> Result<(), CliError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(CliError::Local(format!(
            "unexpected arguments: {}",
            args.join(" ")
        )))
    }
}

fn run_startup(client: &DaemonClient, args: &[String]) -> Result<(), CliError> {
    expect_no_args(args)?;
    println!("switching dome to automatic");
    client.dome_control(true)?.into_result()?;
    println!("switching telescope to automatic");
    client.tel_control(true)?.into_result()?;
    println!("observatory is under automatic control");
    Ok(())
}

fn run_shutdown(client: &DaemonClient, args: &[String]) -> Result<(), CliError> {
    expect_no_args(args)?;
    println!("stopping telescope");
    client.stop_telescope()?.into_result()?;
    println!("switching telescope to manual");
    client.tel_control(false)?.into_result()?;

    println!("clearing dome window");
    let reply = client.clear_dome_window()?;
    if reply.code != CommandStatus::DomeNotAutomatic.code() {
        // A dome already under manual control has no window to clear.
        reply.into_result()?;
    }

    println!("waiting for dome to close");
    wait_for_dome_closed(client)?;
    println!("switching dome to manual");
    client.dome_control(false)?.into_result()?;
    println!("observatory is under manual control");
    Ok(())
}

/// Blocks until the daemon reports the dome `CLOSED`. The dome controller
/// refuses the switch to manual while the shutters are anywhere else.
fn wait_for_dome_closed(client: &DaemonClient) -> Result<(), CliError> {
    for attempt in 0..DOME_CLOSE_ATTEMPTS {
        let status = client.status()?;
        match status["dome"]["status"].as_str() {
            // Dome-less site: nothing to wait for.
            None => return Ok(()),
            Some("CLOSED") => return Ok(()),
            Some(state) => {
                if attempt == 0 {
                    println!("dome is {state}");
                }
                std::thread::sleep(DOME_CLOSE_POLL);
            }
        }
    }
    Err(CliError::Local(
        "dome did not report CLOSED within the shutdown timeout".to_string(),
    ))
}
