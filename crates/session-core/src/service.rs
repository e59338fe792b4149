//! Service scheduler (C5): topological ordering of a node's declared
//! services, template rendering via `handlebars`, and command execution
//! inside the node via C1.

use std::collections::{HashMap, HashSet};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("duplicate service '{0}' declared for node")]
    Duplicate(String),

    #[error("template render failed: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("template write failed: {0}")]
    Write(std::io::Error),

    #[error("validate command exited non-zero: {0}")]
    ValidateFailed(String),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ValidationMode {
    Blocking,
    NonBlocking,
    Timer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub group: String,
    pub executables: Vec<String>,
    pub dependencies: Vec<String>,
    pub directories: Vec<String>,
    /// path -> template source.
    pub templates: HashMap<String, String>,
    pub startup: Vec<Vec<String>>,
    pub validate: Vec<Vec<String>>,
    pub shutdown: Vec<Vec<String>>,
    pub validation_mode: ValidationMode,
    pub validation_timer_ms: u64,
    pub validation_period_ms: u64,
}

/// Resolve `service_names` (in node-declared order) plus their transitive
/// dependencies into a start order. Ties break by insertion order into
/// the requested set, then lexicographic name (spec §4.5); this makes
/// the order stable regardless of how the caller lists the node's
/// services.
pub fn topological_order(
    service_names: &[String],
    catalog: &HashMap<String, Service>,
) -> Vec<String> {
    let mut insertion_index: HashMap<&str, usize> = HashMap::new();
    for (idx, name) in service_names.iter().enumerate() {
        insertion_index.entry(name.as_str()).or_insert(idx);
    }

    // Collect the closure of requested services + transitive deps,
    // warning (not failing) on names missing from the catalog.
    let mut closure: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = service_names.to_vec();
    while let Some(name) = stack.pop() {
        if !closure.insert(name.clone()) {
            continue;
        }
        match catalog.get(&name) {
            Some(svc) => {
                for dep in &svc.dependencies {
                    if !catalog.contains_key(dep) {
                        warn!("service '{}' depends on unknown service '{}', skipping", name, dep);
                        continue;
                    }
                    stack.push(dep.clone());
                }
            }
            None => warn!("requested service '{}' not found in catalog, skipping", name),
        }
    }
    closure.retain(|n| catalog.contains_key(n));

    let mut ordered: Vec<String> = closure.into_iter().collect();
    ordered.sort_by(|a, b| {
        let ia = insertion_index.get(a.as_str()).copied().unwrap_or(usize::MAX);
        let ib = insertion_index.get(b.as_str()).copied().unwrap_or(usize::MAX);
        ia.cmp(&ib).then_with(|| a.cmp(b))
    });

    // Kahn's algorithm over in-degree, visiting the name-stable-sorted
    // frontier first so ties resolve the same way regardless of HashMap
    // iteration order.
    let mut indegree: HashMap<&str, usize> = ordered.iter().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for name in &ordered {
        if let Some(svc) = catalog.get(name) {
            for dep in &svc.dependencies {
                if indegree.contains_key(dep.as_str()) {
                    *indegree.get_mut(name.as_str()).unwrap() += 1;
                    dependents.entry(dep.as_str()).or_default().push(name.as_str());
                }
            }
        }
    }

    let mut ready: Vec<&str> = ordered
        .iter()
        .filter(|n| indegree[n.as_str()] == 0)
        .map(|n| n.as_str())
        .collect();
    ready.sort_by(|a, b| {
        let ia = insertion_index.get(*a).copied().unwrap_or(usize::MAX);
        let ib = insertion_index.get(*b).copied().unwrap_or(usize::MAX);
        ia.cmp(&ib).then_with(|| a.cmp(b))
    });

    let mut result = Vec::with_capacity(ordered.len());
    while !ready.is_empty() {
        ready.sort_by(|a, b| {
            let ia = insertion_index.get(*a).copied().unwrap_or(usize::MAX);
            let ib = insertion_index.get(*b).copied().unwrap_or(usize::MAX);
            ia.cmp(&ib).then_with(|| a.cmp(b))
        });
        let next = ready.remove(0);
        result.push(next.to_string());
        if let Some(deps) = dependents.get(next) {
            for &d in deps {
                let entry = indegree.get_mut(d).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    ready.push(d);
                }
            }
        }
    }

    result
}

/// Render all of a service's templates against a variable map built from
/// session config, node attributes, and the interface table.
pub fn render_templates(
    service: &Service,
    vars: &HashMap<String, Value>,
) -> Result<HashMap<String, String>, ServiceError> {
    let hb = Handlebars::new();
    let mut rendered = HashMap::with_capacity(service.templates.len());
    for (path, template) in &service.templates {
        let output = hb.render_template(template, vars)?;
        rendered.insert(path.clone(), output);
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, deps: &[&str]) -> Service {
        Service {
            name: name.to_string(),
            group: "test".into(),
            executables: vec![],
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            directories: vec![],
            templates: HashMap::new(),
            startup: vec![],
            validate: vec![],
            shutdown: vec![],
            validation_mode: ValidationMode::NonBlocking,
            validation_timer_ms: 0,
            validation_period_ms: 0,
        }
    }

    #[test]
    fn chain_dependency_orders_a_b_c() {
        let mut catalog = HashMap::new();
        catalog.insert("A".to_string(), svc("A", &[]));
        catalog.insert("B".to_string(), svc("B", &["A"]));
        catalog.insert("C".to_string(), svc("C", &["B"]));

        let requested = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(topological_order(&requested, &catalog), vec!["A", "B", "C"]);

        let reversed = vec!["C".to_string(), "B".to_string(), "A".to_string()];
        assert_eq!(topological_order(&reversed, &catalog), vec!["A", "B", "C"]);
    }

    #[test]
    fn missing_dependency_is_skipped_not_fatal() {
        let mut catalog = HashMap::new();
        catalog.insert("A".to_string(), svc("A", &["ghost"]));
        let requested = vec!["A".to_string()];
        assert_eq!(topological_order(&requested, &catalog), vec!["A"]);
    }

    #[test]
    fn template_renders_with_node_vars() {
        let mut templates = HashMap::new();
        templates.insert("/etc/hostname".to_string(), "{{node_name}}".to_string());
        let service = Service {
            templates,
            ..svc("web", &[])
        };
        let mut vars = HashMap::new();
        vars.insert("node_name".to_string(), Value::String("n1".to_string()));
        let rendered = render_templates(&service, &vars).unwrap();
        assert_eq!(rendered["/etc/hostname"], "n1");
    }
}
