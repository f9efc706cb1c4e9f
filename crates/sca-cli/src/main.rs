//! # sca-cli: command-line client for the analysis service
//!
//! - `sca submit <dataset>`: queue an analysis run.
//! - `sca status <id>` / `sca watch <id>`: follow a job.
//! - `sca results <id> --filter ... --sort ...`: page through fault results.
//! - `sca cancel`, `sca delete`, `sca delete-all`, `sca invalidate`.

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tabled::{Table, Tabled};

use sca_core::filter::lookup_field;
use sca_core::{
    DataType, Direction, FaultResultView, FilterDescriptor, FilterOperator, FilterScope, JobId,
    JobStatus, Page, PageRequest, SortOrder,
};

#[derive(Parser)]
#[command(name = "sca", version, about = "Short-circuit analysis client", long_about = None)]
struct Cli {
    /// Hub base URL.
    #[arg(long, env = "SCA_BASE_URL", default_value = "http://127.0.0.1:3000", global = true)]
    base_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a run against a dataset.
    Submit {
        dataset: String,
        #[arg(long)]
        variant: Option<String>,
        /// Solver parameters as a JSON object.
        #[arg(long)]
        params: Option<String>,
        /// Use a job id reserved by the caller.
        #[arg(long)]
        job_id: Option<JobId>,
    },

    /// Print a job's status.
    Status { job_id: JobId },

    /// Request cancellation.
    Cancel { job_id: JobId },

    /// Query one page of fault results.
    Results {
        job_id: JobId,
        /// `field:OPERATOR:value`, repeatable. Prefix the field with `~` to
        /// prune displayed feeders instead of filtering faults.
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// `field[:asc|desc]`, repeatable.
        #[arg(long = "sort")]
        sorts: Vec<String>,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
        /// Print the raw JSON page instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Delete a job and its results.
    Delete { job_id: JobId },

    /// Delete every job.
    DeleteAll,

    /// Overwrite the status of several jobs, dropping their results.
    Invalidate {
        job_ids: Vec<JobId>,
        #[arg(long, default_value = "NOT_DONE")]
        status: String,
    },

    /// Poll a job until it finishes.
    Watch {
        job_id: JobId,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{status}: {message}")]
    Api {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("{0}")]
    Usage(String),
}

#[derive(Deserialize)]
struct ApiError {
    error: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: JobStatus,
}

#[derive(Deserialize)]
struct CancelResponse {
    outcome: String,
}

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Tabled)]
struct FaultRow {
    id: i64,
    fault: String,
    #[tabled(rename = "type")]
    fault_type: String,
    #[tabled(rename = "current (A)")]
    current: String,
    #[tabled(rename = "power (MVA)")]
    power: String,
    violations: usize,
    feeders: String,
}

impl From<&FaultResultView> for FaultRow {
    fn from(view: &FaultResultView) -> Self {
        let feeders = view
            .feeders
            .iter()
            .map(|f| format!("{} ({:.0} A)", f.connectable_id, f.current))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            id: view.id,
            fault: view.fault_id.clone(),
            fault_type: view.fault_type.clone(),
            current: format!("{:.1}", view.current),
            power: format!("{:.2}", view.power),
            violations: view.violations.len(),
            feeders,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let base = cli.base_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            dataset,
            variant,
            params,
            job_id,
        } => {
            let parameters = match params {
                Some(raw) => serde_json::from_str::<serde_json::Value>(&raw)
                    .map_err(|e| CliError::Usage(format!("--params is not JSON: {}", e)))?,
                None => serde_json::Value::Null,
            };
            let payload = serde_json::json!({
                "job_id": job_id,
                "dataset_ref": dataset,
                "variant": variant,
                "parameters": parameters,
            });
            let resp: SubmitResponse =
                expect_json(client.post(format!("{}/api/jobs", base)).json(&payload)).await?;
            println!("{}", resp.job_id);
        }

        Commands::Status { job_id } => {
            let status = fetch_status(&client, &base, job_id).await?;
            println!("{}", status);
        }

        Commands::Cancel { job_id } => {
            let resp: CancelResponse =
                expect_json(client.post(format!("{}/api/jobs/{}/cancel", base, job_id))).await?;
            println!("{}: {}", job_id, resp.outcome);
        }

        Commands::Results {
            job_id,
            filters,
            sorts,
            page,
            size,
            json,
        } => {
            let filters = filters
                .iter()
                .map(|raw| parse_filter(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let mut request = PageRequest::new(page, size);
            for raw in &sorts {
                request = request.sorted_by(parse_sort(raw)?);
            }
            let payload = serde_json::json!({ "filters": filters, "page": request });
            let result: Page<FaultResultView> = expect_json(
                client
                    .post(format!("{}/api/jobs/{}/results/query", base, job_id))
                    .json(&payload),
            )
            .await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).unwrap_or_default()
                );
            } else {
                let rows: Vec<FaultRow> = result.content.iter().map(FaultRow::from).collect();
                println!("{}", Table::new(rows));
                println!(
                    "page {}/{} ({} faults)",
                    result.number + 1,
                    result.total_pages.max(1),
                    result.total_elements
                );
            }
        }

        Commands::Delete { job_id } => {
            send(client.delete(format!("{}/api/jobs/{}", base, job_id))).await?;
            println!("deleted {}", job_id);
        }

        Commands::DeleteAll => {
            let resp: CountResponse =
                expect_json(client.delete(format!("{}/api/jobs", base))).await?;
            println!("deleted {} jobs", resp.count);
        }

        Commands::Invalidate { job_ids, status } => {
            let status = JobStatus::parse(&status.to_ascii_uppercase())
                .ok_or_else(|| CliError::Usage(format!("unknown status '{}'", status)))?;
            let payload = serde_json::json!({ "job_ids": job_ids, "status": status });
            let resp: CountResponse = expect_json(
                client
                    .post(format!("{}/api/jobs/invalidate", base))
                    .json(&payload),
            )
            .await?;
            println!("updated {} jobs", resp.count);
        }

        Commands::Watch {
            job_id,
            interval_ms,
        } => {
            let mut last = None;
            loop {
                let status = match fetch_status(&client, &base, job_id).await {
                    Ok(status) => status,
                    Err(CliError::Api { status, .. }) if status == reqwest::StatusCode::NOT_FOUND => {
                        println!("{} {} gone", timestamp(), job_id);
                        break;
                    }
                    Err(e) => return Err(e),
                };
                if last != Some(status) {
                    println!("{} {} {}", timestamp(), job_id, status);
                    last = Some(status);
                }
                if status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        }
    }
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

async fn fetch_status(
    client: &reqwest::Client,
    base: &str,
    job_id: JobId,
) -> Result<JobStatus, CliError> {
    let resp: StatusResponse =
        expect_json(client.get(format!("{}/api/jobs/{}/status", base, job_id))).await?;
    Ok(resp.status)
}

async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, CliError> {
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ApiError>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("error").to_string(),
    };
    Err(CliError::Api { status, message })
}

async fn expect_json<T: serde::de::DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T, CliError> {
    Ok(send(req).await?.json::<T>().await?)
}

// =============================================================================
// Argument parsing
// =============================================================================

fn parse_operator(raw: &str) -> Option<FilterOperator> {
    let op = match raw.trim().to_ascii_uppercase().as_str() {
        "EQUALS" | "EQ" | "=" => FilterOperator::Equals,
        "CONTAINS" | "~" => FilterOperator::Contains,
        "STARTS_WITH" | "^" => FilterOperator::StartsWith,
        "NOT_EQUAL" | "NE" | "!=" => FilterOperator::NotEqual,
        "LESS_THAN_OR_EQUAL" | "LE" | "<=" => FilterOperator::LessThanOrEqual,
        "GREATER_THAN_OR_EQUAL" | "GE" | ">=" => FilterOperator::GreaterThanOrEqual,
        _ => return None,
    };
    Some(op)
}

/// `field:OPERATOR:value`. The data type comes from the field catalogue.
/// TEXT `EQUALS` takes a `|`-separated list; `null` sends a JSON null.
fn parse_filter(raw: &str) -> Result<FilterDescriptor, CliError> {
    let usage = || CliError::Usage(format!("filter '{}' is not field:OPERATOR:value", raw));
    let mut parts = raw.splitn(3, ':');
    let (field, op, value) = match (parts.next(), parts.next(), parts.next()) {
        (Some(f), Some(o), Some(v)) => (f.trim(), o, v),
        _ => return Err(usage()),
    };

    let (field, scope) = match field.strip_prefix('~') {
        Some(field) => (field, FilterScope::ChildDisplay),
        None => (field, FilterScope::Parent),
    };
    let entry = lookup_field(field)
        .ok_or_else(|| CliError::Usage(format!("unknown field '{}'", field)))?;
    let operator =
        parse_operator(op).ok_or_else(|| CliError::Usage(format!("unknown operator '{}'", op)))?;

    let value = match entry.data_type {
        _ if value == "null" => serde_json::Value::Null,
        DataType::Number => {
            let n: f64 = value
                .trim()
                .parse()
                .map_err(|_| CliError::Usage(format!("'{}' is not a number", value)))?;
            serde_json::json!(n)
        }
        DataType::Text if operator == FilterOperator::Equals && value.contains('|') => {
            serde_json::json!(value.split('|').collect::<Vec<_>>())
        }
        DataType::Text => serde_json::Value::String(value.to_string()),
    };

    Ok(FilterDescriptor {
        field: field.to_string(),
        data_type: entry.data_type,
        operator,
        value,
        scope,
    })
}

/// `field[:asc|desc]`.
fn parse_sort(raw: &str) -> Result<SortOrder, CliError> {
    let (property, direction) = match raw.rsplit_once(':') {
        Some((property, dir)) => {
            let direction = match dir.to_ascii_lowercase().as_str() {
                "asc" => Direction::Asc,
                "desc" => Direction::Desc,
                _ => return Err(CliError::Usage(format!("unknown sort direction '{}'", dir))),
            };
            (property, direction)
        }
        None => (raw, Direction::Asc),
    };
    Ok(SortOrder {
        property: property.trim().to_string(),
        direction,
    })
}
