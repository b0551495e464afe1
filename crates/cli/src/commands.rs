use anyhow::{anyhow, Context};
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::Config;
use ferrous_forward_infrastructure::dns::message::build_query;
use ferrous_forward_infrastructure::dns::{UpstreamFactory, UpstreamRegistry};
use hickory_proto::rr::RecordType;
use std::str::FromStr;
use tracing::{info, warn};

/// Builds the whole graph without starting it and prints the start order.
pub fn check(config: &Config) -> anyhow::Result<()> {
    let upstreams = UpstreamFactory::build_all(config).context("Invalid upstream configuration")?;
    for (i, upstream) in upstreams.iter().enumerate() {
        let deps = upstream.dependencies();
        if deps.is_empty() {
            println!("{:>3}. {} ({})", i + 1, upstream.tag(), upstream.kind());
        } else {
            println!(
                "{:>3}. {} ({}) <- {}",
                i + 1,
                upstream.tag(),
                upstream.kind(),
                deps.join(", ")
            );
        }
    }
    println!("configuration OK: {} upstreams", upstreams.len());
    Ok(())
}

pub async fn query(
    config: &Config,
    name: &str,
    qtype: &str,
    tag: &str,
    print_stats: bool,
) -> anyhow::Result<()> {
    let record_type = RecordType::from_str(&qtype.to_ascii_uppercase())
        .map_err(|e| anyhow!("Unknown record type '{}': {}", qtype, e))?;
    let message = build_query(name, record_type)?;

    let registry = UpstreamRegistry::from_config(config)?;
    let upstream = registry
        .get(tag)
        .ok_or_else(|| anyhow!("No upstream tagged '{}'", tag))?;

    registry.start_all().await?;

    let ctx = ExchangeContext::new();
    let result = tokio::select! {
        result = upstream.exchange(&ctx, message) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling query");
            ctx.cancel.cancel();
            Err(ferrous_forward_domain::DomainError::Cancelled)
        }
    };

    let outcome = match result {
        Ok(response) => {
            info!(
                upstream = tag,
                log_id = ctx.log_id,
                rcode = %response.response_code(),
                answers = response.answers().len(),
                "Query answered"
            );
            println!(";; {} {} via {}: {}", name, record_type, tag, response.response_code());
            for record in response.answers() {
                println!("{}", record);
            }
            Ok(())
        }
        Err(e) => Err(anyhow!(e).context(format!("Query through '{}' failed", tag))),
    };

    if print_stats {
        println!("{}", serde_json::to_string_pretty(&registry.statistics())?);
    }

    registry.close_all().await;
    outcome
}
