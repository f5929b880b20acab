use crate::output::{print_json, print_table};
use anyhow::Context;
use argus_core::config::Config;
use argus_core::service::LookupKind;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ServiceRow {
    id: String,
    name: String,
    lookup: &'static str,
    url: String,
    deployed_lookup: bool,
    active: bool,
}

#[derive(Serialize)]
struct Report {
    services: Vec<ServiceRow>,
    problems: Vec<String>,
}

pub fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let services = config
        .order
        .iter()
        .filter_map(|id| config.service.get(id).map(|svc| (id, svc)))
        .map(|(id, svc)| ServiceRow {
            id: id.clone(),
            name: svc.display_name(id).to_string(),
            lookup: match svc.latest_version.kind {
                LookupKind::Github => "github",
                LookupKind::Url => "url",
            },
            url: svc.latest_version.service_url(),
            deployed_lookup: svc.deployed_version.is_some(),
            active: svc
                .options
                .active
                .or(config.defaults.service.options.active)
                .unwrap_or(true),
        })
        .collect();
    let report = Report {
        services,
        problems: config.validate(),
    };

    if json {
        print_json(&report)?;
    } else {
        let rows = report
            .services
            .iter()
            .map(|s| {
                vec![
                    s.id.clone(),
                    s.name.clone(),
                    s.lookup.to_string(),
                    s.url.clone(),
                    if s.active { "yes" } else { "no" }.to_string(),
                ]
            })
            .collect();
        print_table(&["ID", "NAME", "LOOKUP", "URL", "ACTIVE"], rows);
        for problem in &report.problems {
            println!("[error] {problem}");
        }
    }

    if !report.problems.is_empty() {
        anyhow::bail!("config has {} problem(s)", report.problems.len());
    }
    Ok(())
}
