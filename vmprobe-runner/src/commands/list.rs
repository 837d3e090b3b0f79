//! `vmprobe list` command handler

use std::io::Write;

use serde::Serialize;

use crate::catalog;
use crate::cli::ListArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};
use crate::scenario::{Channel, ScenarioCase};

pub fn execute(args: ListArgs, writer: &OutputWriter) -> Result<(), CliError> {
    let scenarios = catalog::select(catalog::builtin()?, &[], args.tag.as_deref())?;
    writer.render(&ScenarioListing::from_cases(&scenarios))
}

#[derive(Debug, Serialize)]
pub struct ScenarioListing {
    pub scenarios: Vec<ScenarioSummary>,
}

#[derive(Debug, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub steps: Vec<String>,
    pub verification: Option<String>,
    pub host_side: bool,
}

impl ScenarioListing {
    pub fn from_cases(cases: &[ScenarioCase]) -> Self {
        let scenarios = cases
            .iter()
            .map(|case| ScenarioSummary {
                name: case.name.clone(),
                description: case.description.clone(),
                tags: case.tags.clone(),
                steps: case.steps.iter().map(ToString::to_string).collect(),
                verification: case.verification.as_ref().map(ToString::to_string),
                host_side: case.addresses(Channel::Host),
            })
            .collect();
        Self { scenarios }
    }
}

impl Render for ScenarioListing {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        if self.scenarios.is_empty() {
            return writeln!(w, "No scenarios match.");
        }
        writeln!(w, "{:<26} {:<6} {:<22} Description", "Name", "Steps", "Tags")?;
        writeln!(w, "{}", "-".repeat(90))?;
        for s in &self.scenarios {
            writeln!(
                w,
                "{:<26} {:<6} {:<22} {}",
                s.name,
                s.steps.len(),
                s.tags.join(","),
                s.description
            )?;
        }
        writeln!(w)?;
        writeln!(w, "{} scenario(s)", self.scenarios.len())
    }
}
