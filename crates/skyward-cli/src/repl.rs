//! REPL – Read-Eval-Print Loop for the Skyward operator shell.
//!
//! Supported slash-commands:
//!   /help                                  – show this list
//!   /modules                               – list modules and their status
//!   /tasks [status]                        – list tasks, optionally filtered
//!   /submit <prio> <caps> [minutes] [json] – submit an observation
//!   /cancel <task>                         – cancel a task
//!   /purge <task>                          – drop a finished task
//!   /sensor <source> <safe|unsafe> [k=v]…  – feed a weather reading
//!   /heartbeat <module> [fault]            – send a manual heartbeat
//!   /silence <module> | /resume <module>   – stop/restart simulated heartbeats
//!   /disable <module> | /enable <module>   – take a module out of / back into service
//!   /clear <module>                        – clear a module's fault history
//!   /safety                                – show the safety verdict per source
//!   /quit | /exit                          – gracefully exit the CLI

use chrono::{Duration as ChronoDuration, Utc};
use colored::Colorize;
use serde_json::Value;
use skyward_kernel::SensorReading;
use skyward_types::{
    Capability, CapabilitySet, HealthInfo, ModuleId, ModuleStatus, SafetyVerdict,
    SchedulingWindow, SkyError, TaskId, TaskStatus,
};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sim::SimulatedSite;

const DEFAULT_WINDOW_MINUTES: i64 = 60;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Help,
    Modules,
    Tasks(Option<TaskStatus>),
    Submit {
        priority: i32,
        capabilities: CapabilitySet,
        minutes: i64,
        payload: Value,
    },
    Cancel(TaskId),
    Purge(TaskId),
    Sensor {
        source: String,
        safe: bool,
        values: Vec<(String, f64)>,
    },
    Heartbeat {
        module: ModuleId,
        fault: Option<String>,
    },
    Silence(ModuleId, bool),
    Disable(ModuleId),
    Enable(ModuleId),
    ClearFaults(ModuleId),
    Safety,
    Quit,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(site: &SimulatedSite, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "skyward>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(ReplCommand::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => {
                if let Err(e) = execute(site, cmd) {
                    println!("{} {}", "Error:".red(), e);
                }
            }
            Err(msg) => println!("{} Type {} for available commands.", msg.red(), "/help".bold()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse(line: &str) -> Result<ReplCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("Empty command.".to_string());
    };
    let args: Vec<&str> = words.collect();

    match head {
        "/help" => Ok(ReplCommand::Help),
        "/modules" => Ok(ReplCommand::Modules),
        "/tasks" => match args.first() {
            None => Ok(ReplCommand::Tasks(None)),
            Some(s) => s
                .parse::<TaskStatus>()
                .map(|st| ReplCommand::Tasks(Some(st)))
                .map_err(|e| e.to_string()),
        },
        "/submit" => parse_submit(line, &args),
        "/cancel" => task_arg(&args, "/cancel").map(ReplCommand::Cancel),
        "/purge" => task_arg(&args, "/purge").map(ReplCommand::Purge),
        "/sensor" => parse_sensor(&args),
        "/heartbeat" => Ok(ReplCommand::Heartbeat {
            module: module_arg(&args, "/heartbeat")?,
            fault: args.get(1).map(|s| s.to_string()),
        }),
        "/silence" => module_arg(&args, "/silence").map(|m| ReplCommand::Silence(m, true)),
        "/resume" => module_arg(&args, "/resume").map(|m| ReplCommand::Silence(m, false)),
        "/disable" => module_arg(&args, "/disable").map(ReplCommand::Disable),
        "/enable" => module_arg(&args, "/enable").map(ReplCommand::Enable),
        "/clear" => module_arg(&args, "/clear").map(ReplCommand::ClearFaults),
        "/safety" => Ok(ReplCommand::Safety),
        "/quit" | "/exit" => Ok(ReplCommand::Quit),
        other => Err(format!("Unknown command: '{other}'.")),
    }
}

fn parse_submit(line: &str, args: &[&str]) -> Result<ReplCommand, String> {
    const USAGE: &str = "Usage: /submit <priority> <cap[,cap…]> [minutes] [json payload]";
    let (Some(prio), Some(caps)) = (args.first(), args.get(1)) else {
        return Err(USAGE.to_string());
    };
    let priority = prio
        .parse::<i32>()
        .map_err(|_| format!("'{prio}' is not a priority. {USAGE}"))?;
    let capabilities = caps
        .split(',')
        .filter(|c| !c.is_empty())
        .map(str::parse::<Capability>)
        .collect::<Result<CapabilitySet, _>>()
        .map_err(|e| e.to_string())?;

    let mut minutes = DEFAULT_WINDOW_MINUTES;
    let mut payload_from = 2;
    if let Some(m) = args.get(2)
        && let Ok(parsed) = m.parse::<i64>()
    {
        if parsed <= 0 || ChronoDuration::try_minutes(parsed).is_none() {
            return Err(format!("'{m}' is not a usable window length in minutes. {USAGE}"));
        }
        minutes = parsed;
        payload_from = 3;
    }

    // The payload is everything after the positional words, spaces included.
    let payload = if args.len() > payload_from {
        let rest = skip_words(line, payload_from + 1);
        serde_json::from_str(rest).map_err(|e| format!("Invalid JSON payload: {e}"))?
    } else {
        Value::Object(Default::default())
    };

    Ok(ReplCommand::Submit {
        priority,
        capabilities,
        minutes,
        payload,
    })
}

/// The remainder of `line` after its first `n` whitespace-separated words.
fn skip_words(line: &str, n: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest
}

/// A window opening now and closing `minutes` from now.
fn window_from_now(minutes: i64) -> Result<SchedulingWindow, SkyError> {
    let now = Utc::now();
    ChronoDuration::try_minutes(minutes)
        .and_then(|len| now.checked_add_signed(len))
        .map(|latest| SchedulingWindow::new(now, latest))
        .ok_or_else(|| SkyError::InvalidWindow(format!("{minutes} minutes is out of range")))
}

fn parse_sensor(args: &[&str]) -> Result<ReplCommand, String> {
    const USAGE: &str = "Usage: /sensor <source> <safe|unsafe> [key=value …]";
    let (Some(source), Some(flag)) = (args.first(), args.get(1)) else {
        return Err(USAGE.to_string());
    };
    let safe = match *flag {
        "safe" | "ok" => true,
        "unsafe" | "bad" => false,
        other => return Err(format!("'{other}' is neither safe nor unsafe. {USAGE}")),
    };
    let values = args[2..]
        .iter()
        .map(|kv| {
            let (k, v) = kv.split_once('=').ok_or_else(|| format!("'{kv}' is not key=value"))?;
            let v = v
                .parse::<f64>()
                .map_err(|_| format!("'{v}' is not a number"))?;
            Ok((k.to_string(), v))
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(ReplCommand::Sensor {
        source: source.to_string(),
        safe,
        values,
    })
}

fn task_arg(args: &[&str], cmd: &str) -> Result<TaskId, String> {
    let raw = args.first().ok_or_else(|| format!("Usage: {cmd} <task>"))?;
    raw.parse::<TaskId>()
        .map_err(|_| format!("'{raw}' is not a task id"))
}

fn module_arg(args: &[&str], cmd: &str) -> Result<ModuleId, String> {
    args.first()
        .map(|m| ModuleId::new(*m))
        .ok_or_else(|| format!("Usage: {cmd} <module>"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

pub fn execute(site: &SimulatedSite, cmd: ReplCommand) -> Result<(), SkyError> {
    let facility = &site.facility;
    match cmd {
        ReplCommand::Help => cmd_help(),
        ReplCommand::Modules => cmd_modules(site),
        ReplCommand::Tasks(filter) => cmd_tasks(site, filter),
        ReplCommand::Submit {
            priority,
            capabilities,
            minutes,
            payload,
        } => {
            let window = window_from_now(minutes)?;
            let id = facility.submit_task(priority, capabilities, window, payload)?;
            println!("{} {}", "✓ Submitted".green(), id.to_string().bold());
        }
        ReplCommand::Cancel(id) => {
            facility.cancel_task(id)?;
            println!("{} {}", "✓ Cancel requested for".green(), id.to_string().bold());
        }
        ReplCommand::Purge(id) => {
            facility.purge_task(id)?;
            println!("{} {}", "✓ Purged".green(), id.to_string().bold());
        }
        ReplCommand::Sensor {
            source,
            safe,
            values,
        } => {
            let reading = values
                .into_iter()
                .fold(SensorReading::new(safe), |r, (k, v)| r.with_value(k, v));
            let verdict = facility.report_sensor(&source, reading, Utc::now());
            println!("  Safety verdict: {}", paint_verdict(verdict));
        }
        ReplCommand::Heartbeat { module, fault } => {
            let health = fault.map_or_else(HealthInfo::nominal, HealthInfo::with_fault);
            facility.heartbeat(&module, &health)?;
            println!("  {} is {}", module.to_string().bold(), paint_status(facility.module(&module)?.status));
        }
        ReplCommand::Silence(module, silenced) => {
            facility.module(&module)?;
            site.set_silenced(&module, silenced);
            let state = if silenced { "silenced".yellow() } else { "resumed".green() };
            println!("  Heartbeats for {} {}", module.to_string().bold(), state);
        }
        ReplCommand::Disable(module) => {
            facility.disable_module(&module)?;
            println!("  {} is {}", module.to_string().bold(), paint_status(facility.module(&module)?.status));
        }
        ReplCommand::Enable(module) => {
            facility.enable_module(&module)?;
            println!("  {} is {}", module.to_string().bold(), paint_status(facility.module(&module)?.status));
        }
        ReplCommand::ClearFaults(module) => {
            facility.clear_module_faults(&module)?;
            println!("  {} is {}", module.to_string().bold(), paint_status(facility.module(&module)?.status));
        }
        ReplCommand::Safety => cmd_safety(site),
        ReplCommand::Quit => {}
    }
    Ok(())
}

fn cmd_help() {
    println!();
    println!("{}", "Skyward Commands".bold().underline());
    let rows = [
        ("/modules", "list modules and their status"),
        ("/tasks [status]", "list tasks (pending, running, failed, …)"),
        ("/submit <prio> <caps> [min] [json]", "submit an observation"),
        ("/cancel <task>", "cancel a task"),
        ("/purge <task>", "drop a finished task"),
        ("/sensor <src> <safe|unsafe> [k=v]", "feed a weather reading"),
        ("/heartbeat <module> [fault]", "send a manual heartbeat"),
        ("/silence | /resume <module>", "stop or restart simulated heartbeats"),
        ("/disable | /enable <module>", "take a module out of or back into service"),
        ("/clear <module>", "clear a module's faults"),
        ("/safety", "show the safety verdict"),
        ("/quit  /exit", "exit the CLI"),
    ];
    for (cmd, what) in rows {
        println!("  {:<38} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn cmd_modules(site: &SimulatedSite) {
    let mut modules = site.facility.modules();
    modules.sort_by(|a, b| a.id.cmp(&b.id));
    println!("{}", "Modules".bold().underline());
    if modules.is_empty() {
        println!("  (none registered)");
    }
    for m in modules {
        let caps: Vec<String> = m.capabilities.iter().map(Capability::to_string).collect();
        let lease = m.lease.map(|t| format!(" leased by {t}")).unwrap_or_default();
        let quiet = if site.is_silenced(&m.id) { " (silenced)".dimmed().to_string() } else { String::new() };
        println!(
            "  {:<12} {:<10} [{}]{}{}",
            m.id.to_string().bold(),
            paint_status(m.status),
            caps.join(", "),
            lease,
            quiet
        );
    }
}

fn cmd_tasks(site: &SimulatedSite, filter: Option<TaskStatus>) {
    let tasks = site.facility.list_tasks(filter);
    println!("{}", "Tasks".bold().underline());
    if tasks.is_empty() {
        println!("  (none)");
    }
    for t in tasks {
        let caps: Vec<String> = t.capabilities.iter().map(Capability::to_string).collect();
        let error = t
            .last_error
            .as_ref()
            .map(|e| format!(" – {e}").red().to_string())
            .unwrap_or_default();
        println!(
            "  {:<8} prio {:>3}  {:<10} retries {}/{}  [{}]{}",
            t.id.to_string().bold(),
            t.priority,
            paint_task(t.status),
            t.retry_count,
            t.max_retries,
            caps.join(", "),
            error
        );
    }
}

fn cmd_safety(site: &SimulatedSite) {
    let state = site.facility.safety_state();
    println!("{}", "Safety".bold().underline());
    println!(
        "  Verdict: {} since {}",
        paint_verdict(state.verdict),
        state.since.format("%H:%M:%S")
    );
    for (source, s) in &state.sources {
        let flag = if s.effective_safe { "safe".green() } else { "unsafe".red() };
        let violation = s.violation.as_deref().unwrap_or("");
        println!(
            "  {:<10} {:<6} streak {} at {} {}",
            source.bold(),
            flag,
            s.consecutive_safe,
            s.timestamp.format("%H:%M:%S"),
            violation.dimmed()
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn paint_verdict(v: SafetyVerdict) -> colored::ColoredString {
    match v {
        SafetyVerdict::Safe => v.to_string().green().bold(),
        SafetyVerdict::Unsafe => v.to_string().red().bold(),
        SafetyVerdict::Unknown => v.to_string().yellow().bold(),
    }
}

fn paint_status(s: ModuleStatus) -> colored::ColoredString {
    match s {
        ModuleStatus::Idle => s.to_string().green(),
        ModuleStatus::Leased => s.to_string().cyan(),
        ModuleStatus::Offline | ModuleStatus::Disabled => s.to_string().dimmed(),
        ModuleStatus::Error => s.to_string().red(),
    }
}

fn paint_task(s: TaskStatus) -> colored::ColoredString {
    match s {
        TaskStatus::Completed => s.to_string().green(),
        TaskStatus::Running | TaskStatus::Scheduled => s.to_string().cyan(),
        TaskStatus::Failed | TaskStatus::Aborted => s.to_string().red(),
        TaskStatus::Pending => s.to_string().normal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SimModule};
    use serde_json::json;

    #[test]
    fn submit_parses_capabilities_window_and_payload() {
        let cmd = parse(r#"/submit 5 mount,imaging 30 {"target": "M42", "exposure_s": 60}"#).unwrap();
        assert_eq!(
            cmd,
            ReplCommand::Submit {
                priority: 5,
                capabilities: [Capability::Mount, Capability::Imaging].into(),
                minutes: 30,
                payload: json!({"target": "M42", "exposure_s": 60}),
            }
        );
    }

    #[test]
    fn submit_defaults_window_and_payload() {
        let ReplCommand::Submit { minutes, payload, .. } = parse("/submit -1 camera").unwrap() else {
            panic!("expected submit");
        };
        assert_eq!(minutes, DEFAULT_WINDOW_MINUTES);
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn submit_rejects_bad_input() {
        assert!(parse("/submit").is_err());
        assert!(parse("/submit high imaging").is_err());
        assert!(parse("/submit 1 imaging {not json").is_err());
    }

    #[test]
    fn submit_rejects_unusable_window_lengths() {
        for line in ["/submit 1 imaging 0", "/submit 1 imaging -15", "/submit 1 imaging 99999999999999999"] {
            let err = parse(line).unwrap_err();
            assert!(err.contains("window length"), "{line}: {err}");
        }
        assert!(matches!(window_from_now(i64::MAX), Err(SkyError::InvalidWindow(_))));
        assert!(matches!(window_from_now(153_722_867_280), Err(SkyError::InvalidWindow(_))));
        assert!(window_from_now(90).is_ok());
    }

    #[test]
    fn submit_payload_starts_after_positional_words() {
        let ReplCommand::Submit { minutes, payload, .. } = parse("/submit 3 imaging 60 3").unwrap() else {
            panic!("expected submit");
        };
        assert_eq!(minutes, 60);
        assert_eq!(payload, json!(3));

        let ReplCommand::Submit { payload, .. } =
            parse(r#"/submit  2   imaging   "imaging flats""#).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(payload, json!("imaging flats"));
    }

    #[test]
    fn sensor_parses_values() {
        assert_eq!(
            parse("/sensor weather unsafe wind_speed=22.5 rain=1").unwrap(),
            ReplCommand::Sensor {
                source: "weather".into(),
                safe: false,
                values: vec![("wind_speed".into(), 22.5), ("rain".into(), 1.0)],
            }
        );
        assert!(parse("/sensor weather maybe").is_err());
        assert!(parse("/sensor weather safe wind").is_err());
    }

    #[test]
    fn task_and_module_arguments() {
        assert_eq!(parse("/cancel task-7").unwrap(), ReplCommand::Cancel(TaskId(7)));
        assert_eq!(parse("/purge 3").unwrap(), ReplCommand::Purge(TaskId(3)));
        assert_eq!(
            parse("/tasks failed").unwrap(),
            ReplCommand::Tasks(Some(TaskStatus::Failed))
        );
        assert_eq!(
            parse("/heartbeat dome-1 ERR_Shutter").unwrap(),
            ReplCommand::Heartbeat {
                module: "dome-1".into(),
                fault: Some("ERR_Shutter".into()),
            }
        );
        assert!(parse("/cancel").is_err());
        assert!(parse("/disable").is_err());
        assert!(parse("/launch").is_err());
        assert_eq!(parse("/exit").unwrap(), ReplCommand::Quit);
    }

    fn site() -> SimulatedSite {
        let mut cfg = Config::default();
        cfg.sim_latency_ms = 5;
        cfg.facility.tick_interval_ms = 20;
        cfg.modules = vec![SimModule {
            id: "camera-1".into(),
            capabilities: vec![Capability::Imaging],
        }];
        SimulatedSite::start(&cfg).unwrap()
    }

    #[tokio::test]
    async fn executed_commands_reach_the_facility() {
        let site = site();
        execute(&site, parse("/submit 2 imaging").unwrap()).unwrap();
        let tasks = site.facility.list_tasks(None);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, 2);

        execute(&site, parse(&format!("/cancel {}", tasks[0].id)).unwrap()).unwrap();
        let task = site.facility.get_task_status(tasks[0].id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        execute(&site, parse("/disable camera-1").unwrap()).unwrap();
        assert_eq!(
            site.facility.module(&"camera-1".into()).unwrap().status,
            ModuleStatus::Disabled
        );
        execute(&site, parse("/enable camera-1").unwrap()).unwrap();
        assert_eq!(
            site.facility.module(&"camera-1".into()).unwrap().status,
            ModuleStatus::Idle
        );
    }

    #[tokio::test]
    async fn execution_errors_surface_as_sky_errors() {
        let site = site();
        assert!(matches!(
            execute(&site, parse("/submit 1 dome").unwrap()),
            Err(SkyError::NoCapableModule(Capability::Dome))
        ));
        assert!(matches!(
            execute(&site, parse("/heartbeat ghost").unwrap()),
            Err(SkyError::UnknownModule(_))
        ));
        assert!(matches!(
            execute(&site, parse("/silence ghost").unwrap()),
            Err(SkyError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn sensor_command_updates_verdict() {
        let site = site();
        execute(&site, parse("/sensor weather unsafe").unwrap()).unwrap();
        assert_eq!(site.facility.safety_state().verdict, SafetyVerdict::Unsafe);
    }
}
