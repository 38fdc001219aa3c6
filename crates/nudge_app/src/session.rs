//! Line-based command interface over [`ReminderService`].

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use nudge_domain::{
    occurrence::OccurrenceId,
    task::{whole_days, Schedule, TaskId},
    ReminderService, TaskOverview, TaskUpdate,
};
use tracing::debug;

const HELP: &str = "commands:
  once <rfc3339> <text>                    remind once at an instant
  in <minutes> <text>                      remind once, minutes from now
  every <min_days> <max_days> <HH:MM> <text>  remind periodically (UTC)
  done <occurrence>                        acknowledge a reminder
  snooze <occurrence> <minutes>            move a pending reminder
  edit <task> <text>                       change a task's text
  delete <task>                            remove a task
  list                                     show your tasks
  help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Once {
        at: DateTime<Utc>,
        text: String,
    },
    Every {
        min_days: i64,
        max_days: i64,
        time_of_day: Duration,
        text: String,
    },
    Done(OccurrenceId),
    Snooze {
        occurrence: OccurrenceId,
        at: DateTime<Utc>,
    },
    Edit {
        task: TaskId,
        text: String,
    },
    Delete(TaskId),
    List,
    Help,
    Quit,
}

/// Splits off the first whitespace-delimited word.
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

fn required<'a>(word: &'a str, what: &str) -> Result<&'a str> {
    if word.is_empty() {
        bail!("missing {what}");
    }
    Ok(word)
}

fn text_of(rest: &str) -> Result<String> {
    let text = rest.trim();
    if text.is_empty() {
        bail!("missing reminder text");
    }
    Ok(text.to_string())
}

fn minutes(word: &str) -> Result<Duration> {
    let value: i64 = required(word, "minutes")?
        .parse()
        .with_context(|| format!("invalid minutes: {word}"))?;
    if value < 0 {
        bail!("minutes must not be negative");
    }
    Duration::try_minutes(value).with_context(|| format!("minutes out of range: {word}"))
}

/// `now` plus a minute count, rejecting instants chrono cannot represent.
fn minutes_after(now: DateTime<Utc>, word: &str) -> Result<DateTime<Utc>> {
    now.checked_add_signed(minutes(word)?)
        .with_context(|| format!("{word} minutes from now is out of range"))
}

fn time_of_day(word: &str) -> Result<Duration> {
    let time = NaiveTime::parse_from_str(required(word, "time of day")?, "%H:%M")
        .with_context(|| format!("invalid time of day (expected HH:MM): {word}"))?;
    Ok(Duration::seconds(i64::from(time.num_seconds_from_midnight())))
}

impl Command {
    /// Parses one input line. Relative times resolve against `now`. Blank
    /// lines yield `None`.
    pub fn parse(line: &str, now: DateTime<Utc>) -> Result<Option<Self>> {
        let (verb, rest) = next_word(line);
        let command = match verb.to_ascii_lowercase().as_str() {
            "" => return Ok(None),
            "once" => {
                let (at, rest) = next_word(rest);
                let at = DateTime::parse_from_rfc3339(required(at, "time")?)
                    .with_context(|| format!("invalid RFC 3339 time: {at}"))?
                    .with_timezone(&Utc);
                Command::Once {
                    at,
                    text: text_of(rest)?,
                }
            }
            "in" => {
                let (delay, rest) = next_word(rest);
                Command::Once {
                    at: minutes_after(now, delay)?,
                    text: text_of(rest)?,
                }
            }
            "every" => {
                let (min_days, rest) = next_word(rest);
                let (max_days, rest) = next_word(rest);
                let (at, rest) = next_word(rest);
                Command::Every {
                    min_days: required(min_days, "minimum days")?
                        .parse()
                        .with_context(|| format!("invalid day count: {min_days}"))?,
                    max_days: required(max_days, "maximum days")?
                        .parse()
                        .with_context(|| format!("invalid day count: {max_days}"))?,
                    time_of_day: time_of_day(at)?,
                    text: text_of(rest)?,
                }
            }
            "done" | "ack" => Command::Done(occurrence_id(rest)?),
            "snooze" => {
                let (id, rest) = next_word(rest);
                Command::Snooze {
                    occurrence: occurrence_id(id)?,
                    at: minutes_after(now, rest.trim())?,
                }
            }
            "edit" => {
                let (id, rest) = next_word(rest);
                Command::Edit {
                    task: task_id(id)?,
                    text: text_of(rest)?,
                }
            }
            "delete" | "rm" => Command::Delete(task_id(rest)?),
            "list" | "ls" => Command::List,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(anyhow!("unknown command `{other}`, try `help`")),
        };
        Ok(Some(command))
    }
}

fn occurrence_id(word: &str) -> Result<OccurrenceId> {
    required(word.trim(), "occurrence id")?
        .parse()
        .with_context(|| format!("invalid occurrence id: {}", word.trim()))
}

fn task_id(word: &str) -> Result<TaskId> {
    required(word.trim(), "task id")?
        .parse()
        .with_context(|| format!("invalid task id: {}", word.trim()))
}

pub enum Flow {
    Continue(String),
    Quit,
}

pub struct Session<'a> {
    service: &'a ReminderService,
    owner: String,
}

impl<'a> Session<'a> {
    pub fn new(service: &'a ReminderService, owner: String) -> Self {
        Self { service, owner }
    }

    pub fn help() -> &'static str {
        HELP
    }

    pub async fn handle_line(&self, line: &str) -> Result<Flow> {
        match Command::parse(line, Utc::now())? {
            Some(command) => self.execute(command).await,
            None => Ok(Flow::Continue(String::new())),
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Flow> {
        debug!(?command, "executing command");
        let reply = match command {
            Command::Once { at, text } => {
                let created = self
                    .service
                    .create_task(&self.owner, &text, Schedule::single(at))
                    .await?;
                format!("created {}", describe(&created))
            }
            Command::Every {
                min_days,
                max_days,
                time_of_day,
                text,
            } => {
                let schedule =
                    Schedule::periodic(whole_days(min_days)?, whole_days(max_days)?, time_of_day)?;
                let created = self
                    .service
                    .create_task(&self.owner, &text, schedule)
                    .await?;
                format!("created {}", describe(&created))
            }
            Command::Done(id) => match self.service.acknowledge(id).await? {
                Some(next) => format!(
                    "done; next reminder {} (occurrence {})",
                    format_time(next.next_time),
                    next.id
                ),
                None => "done".to_string(),
            },
            Command::Snooze { occurrence, at } => {
                let moved = self.service.reschedule(occurrence, at).await?;
                format!("snoozed until {}", format_time(moved.next_time))
            }
            Command::Edit { task, text } => {
                let updated = self.service.update_task(task, TaskUpdate::text(text)).await?;
                format!("updated {}", describe(&updated))
            }
            Command::Delete(task) => {
                self.service.delete_task(task).await?;
                "deleted".to_string()
            }
            Command::List => {
                let tasks = self.service.tasks_for(&self.owner).await?;
                if tasks.is_empty() {
                    "no tasks".to_string()
                } else {
                    tasks.iter().map(describe).collect::<Vec<_>>().join("\n")
                }
            }
            Command::Help => HELP.to_string(),
            Command::Quit => return Ok(Flow::Quit),
        };
        Ok(Flow::Continue(reply))
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn describe(overview: &TaskOverview) -> String {
    let task = &overview.task;
    let schedule = match &task.schedule {
        Schedule::Single { at } => format!("once at {}", format_time(*at)),
        Schedule::Periodic(periodic) => {
            let (min, max) = periodic.day_window();
            let minutes = periodic.time_of_day.num_minutes();
            format!(
                "every {min}-{max} days at {:02}:{:02}",
                minutes / 60,
                minutes % 60
            )
        }
    };
    let pending = match &overview.pending {
        Some(occurrence) => format!(
            "next {} (occurrence {})",
            format_time(occurrence.next_time),
            occurrence.id
        ),
        None => "nothing pending".to_string(),
    };
    format!("task {} \"{}\" {schedule}; {pending}", task.id, task.text)
}
