//! Hive - Rust 编码智能体运行时
//!
//! 入口：初始化日志与配置，构建 Agent，执行任务（交互审批、结束后可撤销）或流式问答。
//!
//! ```text
//! hive [--mode <ask|edit|debug|design|agent|terminal>] <task...>
//! hive ask <question...>
//! ```

use std::io::Write;

use anyhow::{bail, Context};
use hive::agent::Agent;
use hive::config::load_config;
use hive::core::{CapabilityMode, RuntimeState, Task, TaskFailure};
use hive::observability;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

const USAGE: &str = "usage: hive [--mode <mode>] <task...> | hive ask <question...>";

enum Command {
    Run {
        mode: Option<CapabilityMode>,
        task: String,
    },
    Ask(String),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let mut mode = None;
    let mut words = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" | "-m" => {
                let value = args.next().context("--mode needs a value")?;
                mode = Some(value.parse::<CapabilityMode>().map_err(anyhow::Error::msg)?);
            }
            "-h" | "--help" => bail!(USAGE),
            _ => words.push(arg),
        }
    }
    match words.first().map(String::as_str) {
        None => bail!(USAGE),
        Some("ask") if words.len() > 1 => Ok(Command::Ask(words[1..].join(" "))),
        _ => Ok(Command::Run {
            mode,
            task: words.join(" "),
        }),
    }
}

async fn prompt_yes(lines: &mut Lines<BufReader<Stdin>>, question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_summary(task: &Task) {
    println!("\nTask {:?}: {}", task.status, task.description);
    for step in &task.steps {
        let detail = step.error.as_deref().unwrap_or("");
        println!("  [{:?}] {} ({}) {}", step.status, step.id, step.tool_name, detail);
    }
}

/// 驱动审批循环直到任务结束
async fn drive(
    agent: &Agent,
    lines: &mut Lines<BufReader<Stdin>>,
    mut result: Result<Task, TaskFailure>,
) -> anyhow::Result<Result<Task, TaskFailure>> {
    loop {
        let task = match result {
            Ok(task) if agent.state().state() == RuntimeState::AwaitingApproval => task,
            other => return Ok(other),
        };
        let Some(step) = task.next_unsettled().map(|i| &task.steps[i]) else {
            return Ok(Ok(task));
        };
        println!(
            "\nStep {} wants to run {}: {}\n  parameters: {}",
            step.id, step.tool_name, step.description, step.parameters
        );
        let step_id = step.id.clone();
        let orchestrator = agent.orchestrator();
        if prompt_yes(lines, "Approve?").await? {
            orchestrator.approve_step(&step_id).await?;
            result = orchestrator.resume().await;
        } else {
            result = orchestrator.reject_step(&step_id).await;
            if orchestrator.has_active_task() {
                result = orchestrator.resume().await;
            }
        }
    }
}

async fn run_task(agent: &Agent, mode: CapabilityMode, description: &str) -> anyhow::Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let first = agent.start_agent(description, mode).await;
    let outcome = drive(agent, &mut lines, first).await?;
    let ok = match &outcome {
        Ok(task) => {
            print_summary(task);
            true
        }
        Err(failure) => {
            eprintln!("\nTask failed: {failure}");
            if let Some(task) = &failure.task {
                print_summary(task);
            }
            false
        }
    };
    agent.reset();

    if agent.executor().rollback_depth() > 0
        && prompt_yes(&mut lines, "Undo the last change?").await?
    {
        let undone = agent.undo().await?;
        println!("{}", if undone { "Undone." } else { "Nothing to undo." });
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let command = parse_args(std::env::args().skip(1))?;
    let cfg = load_config(None).context("Failed to load config")?;
    let agent = Agent::from_config(&cfg).context("Failed to create agent")?;
    agent.state().subscribe(|event| {
        eprintln!("[{:?}] {}%", event.state, event.progress);
        Ok(())
    });

    let ok = match command {
        Command::Run { mode, task } => {
            let mode = mode.unwrap_or_else(|| agent.state().mode());
            run_task(&agent, mode, &task).await?
        }
        Command::Ask(question) => {
            let answer = agent
                .ask(&question, |token| {
                    print!("{token}");
                    let _ = std::io::stdout().flush();
                })
                .await;
            println!();
            if let Err(e) = &answer {
                eprintln!("{e}");
            }
            answer.is_ok()
        }
    };

    agent.shutdown();
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
