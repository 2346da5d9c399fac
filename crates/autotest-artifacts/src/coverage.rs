use anyhow::{anyhow, Context, Result};
use autotest_core::{round2, ExecutionResult, UncoveredLines};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::xml::{parse_document, Element};

pub fn parse_coverage(path: &Path) -> ExecutionResult {
    match fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))
        .and_then(|text| parse_coverage_str(&text))
    {
        Ok(result) => result,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "coverage artifact could not be parsed");
            ExecutionResult::failed(Some(format!("coverage artifact unreadable: {:#}", err)))
        }
    }
}

pub fn parse_coverage_str(text: &str) -> Result<ExecutionResult> {
    let root = parse_document(text)?;
    let line_rate = match root.attr("line-rate") {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| anyhow!("invalid line-rate: {}", raw))?,
        None => 0.0,
    };

    let mut uncovered = UncoveredLines::new();
    for package in root.iter_named("package") {
        for class in package.iter_named("class") {
            let filename = class.attr("filename").unwrap_or("unknown");
            let missing = missing_lines(class)?;
            if !missing.is_empty() {
                uncovered.insert(filename.to_string(), missing);
            }
        }
    }

    Ok(ExecutionResult::covered(round2(line_rate * 100.0), uncovered))
}

fn missing_lines(class: &Element) -> Result<Vec<u32>> {
    let mut missing = Vec::new();
    for line in class.iter_named("line") {
        // A line without a hit count was never executed.
        if line.attr("hits").unwrap_or("0") != "0" {
            continue;
        }
        let raw = line
            .attr("number")
            .ok_or_else(|| anyhow!("line element without number"))?;
        let number = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid line number: {}", raw))?;
        missing.push(number);
    }
    Ok(missing)
}
