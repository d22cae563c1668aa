use crate::query::formatters::{OutputFormat, format_points, format_stats};
use crate::repository::PointRepository;
use anyhow::Result;

#[derive(Debug, Default)]
pub struct RecentQuery {
    pub token: Option<String>,
    pub limit: usize,
}

pub fn cmd_recent(repo: &PointRepository, query: RecentQuery, format: &OutputFormat) -> Result<()> {
    if query.limit == 0 {
        return Err(anyhow::anyhow!("--limit must be greater than zero"));
    }

    let points = repo.recent(query.token.as_deref(), query.limit)?;
    let output = format_points(&points, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_stats(repo: &PointRepository, format: &OutputFormat) -> Result<()> {
    let stats = repo.token_stats()?;
    let output = format_stats(&stats, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_last_block(repo: &PointRepository) -> Result<()> {
    match repo.last_block()? {
        Some(block) => println!("{block}"),
        None => println!("No blocks recorded."),
    }

    Ok(())
}
