use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use resumr::config::Config;
use resumr::domain::{HistoryQuery, NewTask, Service, ServiceStatus, Task, TaskPayload, TaskStatus};
use resumr::events::{EventBus, SchedulerEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use resumr::id::now_ms;
use resumr::providers;
use resumr::scheduler::{Scheduler, SchedulerSettings};
use resumr::store::Persistence;

fn setup_logging(to_stderr: bool, level: Option<&str>) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));

    if to_stderr {
        env_logger::Builder::from_env(env)
            .target(env_logger::Target::Stderr)
            .init();
        return Ok(());
    }

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resumr")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("resumr.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run => handle_run_command(config).await,
        Commands::Status { json, service: None } => handle_status_command(*json, config),
        Commands::Status {
            json,
            service: Some(service),
        } => handle_service_log_command(service, *json, config),
        Commands::History { status, service, limit } => handle_history_command(*status, service.as_deref(), *limit, config),
        Commands::Cleanup { days } => handle_cleanup_command(*days, config),
        Commands::Submit {
            service,
            payload,
            priority,
            timeout,
            key,
            dedupe,
        } => {
            let payload: TaskPayload = serde_json::from_str(payload).context("Invalid task payload")?;
            let mut request = NewTask::new(service, payload).with_priority(*priority);
            if let Some(key) = key {
                request = request.with_idempotency_key(key);
            } else if *dedupe {
                request = request.keyed_by_payload();
            }
            handle_submit_command(request, *timeout, config).await
        }
    }
}

async fn start_scheduler(config: &Config) -> Result<Scheduler> {
    let persistence = Persistence::from_config(&config.storage).context("Failed to open storage")?;
    let mut builder = Scheduler::builder(SchedulerSettings::from(config)).store(persistence);

    let services = providers::from_config(&config.services).context("Failed to configure services")?;
    if services.is_empty() {
        return Err(eyre!("No services enabled in configuration"));
    }
    info!("Registering {} services", services.len());
    for service in services {
        builder = builder.service(service.provider).handler(service.kind, service.handler);
    }

    builder.start().await.context("Failed to start scheduler")
}

async fn handle_run_command(config: &Config) -> Result<()> {
    let scheduler = start_scheduler(config).await?;

    let printer = tokio::spawn(print_events(scheduler.bus().subscribe()));

    let status = scheduler.handle().status().await.context("Failed to read scheduler status")?;
    print_services(&status.services);
    println!(
        "{} {} queued, {} retrying",
        "Scheduler running:".green(),
        status.queue.len() + usize::from(status.current_task.is_some()),
        status.retrying.len()
    );
    println!("{}", "Press Ctrl-C to stop".dimmed());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    println!("{}", "Shutting down...".cyan());

    scheduler.shutdown().await.context("Failed to stop scheduler")?;
    printer.abort();
    Ok(())
}

fn handle_status_command(json: bool, config: &Config) -> Result<()> {
    let persistence = Persistence::from_config(&config.storage).context("Failed to open storage")?;
    let snapshot = persistence
        .load_latest_snapshot(now_ms())
        .context("Failed to load snapshot")?;
    let stats = persistence.stats().context("Failed to read store stats")?;

    if json {
        let output = serde_json::json!({ "snapshot": snapshot, "stats": stats });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let Some(snapshot) = snapshot else {
        println!("{}", "No saved state (never run, or older than the snapshot TTL)".yellow());
        return Ok(());
    };

    println!("{} {}", "Saved at:".green(), format_time(snapshot.timestamp));
    print_services(&snapshot.services);

    if let Some(task) = &snapshot.current_task {
        println!("{}", "Interrupted:".yellow());
        print_task(task);
    }
    println!("{} {}", "Queued:".green(), snapshot.queue.len());
    for task in &snapshot.queue {
        print_task(task);
    }
    if !snapshot.retrying.is_empty() {
        println!("{} {}", "Retrying:".yellow(), snapshot.retrying.len());
        for entry in &snapshot.retrying {
            print_task(&entry.task);
            println!("      due {}", format_time(entry.due_at));
        }
    }
    println!(
        "{} {} history, {} service snapshots",
        "Stored:".dimmed(),
        stats.history,
        stats.service_snapshots
    );
    Ok(())
}

fn handle_service_log_command(service_id: &str, json: bool, config: &Config) -> Result<()> {
    let persistence = Persistence::from_config(&config.storage).context("Failed to open storage")?;
    let entries = persistence
        .service_history(service_id)
        .context("Failed to read service history")?;

    if json {
        let output: Vec<_> = entries
            .iter()
            .map(|(at, service)| serde_json::json!({ "recorded_at": at, "service": service }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{} {}", "No recorded status for".yellow(), service_id);
        return Ok(());
    }
    for (recorded_at, service) in &entries {
        print!("{}", format_time(*recorded_at).dimmed());
        print_services(std::slice::from_ref(service));
    }
    Ok(())
}

fn handle_history_command(
    status: Option<TaskStatus>,
    service: Option<&str>,
    limit: usize,
    config: &Config,
) -> Result<()> {
    let persistence = Persistence::from_config(&config.storage).context("Failed to open storage")?;

    let mut query = HistoryQuery::default().limit(limit);
    if let Some(status) = status {
        query = query.with_status(status);
    }
    if let Some(service) = service {
        query = query.with_service(service);
    }

    let records = persistence.query_history(&query).context("Failed to query history")?;
    if records.is_empty() {
        println!("{}", "No archived tasks".yellow());
        return Ok(());
    }
    for record in &records {
        print!("{} ", format_time(record.archived_at).dimmed());
        print_task(&record.task);
        if let Some(error) = &record.task.error {
            println!("      {}", error.red());
        }
    }
    Ok(())
}

fn handle_cleanup_command(days: Option<u64>, config: &Config) -> Result<()> {
    let mut persistence = Persistence::from_config(&config.storage).context("Failed to open storage")?;
    if let Some(days) = days {
        persistence = persistence.with_retention(Duration::from_secs(days * 24 * 60 * 60));
    }

    let report = persistence.cleanup(now_ms()).context("Cleanup failed")?;
    println!(
        "{} {} history records, {} service snapshots",
        "Removed:".green(),
        report.history,
        report.service_snapshots
    );
    Ok(())
}

async fn handle_submit_command(request: NewTask, timeout: Option<u64>, config: &Config) -> Result<()> {
    let scheduler = start_scheduler(config).await?;

    let task = scheduler
        .handle()
        .enqueue(request)
        .await
        .context("Failed to enqueue task")?;
    if task.is_attached() {
        println!("{} {}", "Attached to:".green(), task.id());
    } else {
        println!("{} {}", "Submitted:".green(), task.id());
    }

    let outcome = match timeout {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), task.wait()).await {
            Ok(outcome) => Some(outcome),
            Err(_) => None,
        },
        None => Some(task.wait().await),
    };

    scheduler.shutdown().await.context("Failed to stop scheduler")?;

    match outcome {
        Some(Ok(result)) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Some(Err(e)) => Err(eyre!("Task failed: {}", e)),
        None => {
            println!("{}", "Timed out waiting; the task stays queued for the next run".yellow());
            Ok(())
        }
    }
}

/// Print events until the bus closes. Returns how many were printed.
async fn print_events(mut events: broadcast::Receiver<SchedulerEvent>) -> usize {
    let mut printed = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                print_event(&event);
                printed += 1;
            }
            Err(RecvError::Lagged(skipped)) => warn!("Event printer lagged, skipped {} events", skipped),
            Err(RecvError::Closed) => return printed,
        }
    }
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Exhausted {
            service_name,
            reset_time,
            queue_length,
            ..
        } => {
            let reset = reset_time.map(format_time).unwrap_or_else(|| "unknown".to_string());
            println!(
                "{} {} (reset {}, {} waiting)",
                "Exhausted:".red(),
                service_name,
                reset,
                queue_length
            );
        }
        SchedulerEvent::ServiceRecovered { service_name, .. } => {
            println!("{} {}", "Recovered:".green(), service_name);
        }
        SchedulerEvent::TaskCompleted { task_id, service_id } => {
            println!("{} {} on {}", "Completed:".green(), task_id, service_id);
        }
        SchedulerEvent::TaskFailed {
            task_id,
            service_id,
            error,
        } => {
            println!("{} {} on {}: {}", "Failed:".red(), task_id, service_id, error);
        }
    }
}

fn print_services(services: &[Service]) {
    for service in services {
        let status = match service.status {
            ServiceStatus::Available => service.status.as_str().green(),
            ServiceStatus::Limited => service.status.as_str().red(),
            ServiceStatus::Error => service.status.as_str().red(),
            ServiceStatus::Unknown => service.status.as_str().yellow(),
        };
        print!("  {:<12} {:<10}", service.id, status);
        if let Some(reset) = service.reset_time {
            print!(" reset {}", format_time(reset));
        }
        if let Some(error) = &service.last_error {
            print!(" {}", error.dimmed());
        }
        println!();
    }
}

fn print_task(task: &Task) {
    let status = match task.status {
        TaskStatus::Completed => task.status.as_str().green(),
        TaskStatus::Failed => task.status.as_str().red(),
        _ => task.status.as_str().yellow(),
    };
    println!(
        "  {} {:<10} {:<9} {:<10} {} retries={}",
        task.id,
        status,
        task.priority.as_str(),
        task.service_id,
        task.kind(),
        task.retry_count
    );
}

fn format_time(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch_ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_stderr, config.log_level.as_deref()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(n: u32) -> SchedulerEvent {
        SchedulerEvent::TaskCompleted {
            task_id: format!("task-{}", n),
            service_id: "github".to_string(),
        }
    }

    #[tokio::test]
    async fn test_event_printer_survives_lag() {
        let (tx, rx) = broadcast::channel(2);
        for n in 0..5 {
            tx.send(completed(n)).unwrap();
        }
        drop(tx);

        // The three oldest were overwritten; the printer keeps going and prints the rest
        assert_eq!(print_events(rx).await, 2);
    }

    #[test]
    fn test_format_time_falls_back_to_raw_value() {
        assert_eq!(format_time(i64::MAX), i64::MAX.to_string());
    }
}
