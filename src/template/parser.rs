//! Template parser for loading templates and resolving parameters.
//!
//! This module handles loading the template set from one or more YAML files,
//! merging parameter values from their three sources (CLI flags, a parameter
//! file, environment variables), and substituting `${param:...}` placeholders
//! so the planner only ever sees fully resolved templates.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, StrataError, TemplateError};

use super::spec::{ParameterSpec, ParameterType, TemplateSet};

/// Environment variable prefix for parameter values.
const PARAM_ENV_PREFIX: &str = "STRATA_PARAM_";

/// Parameter values merged from CLI flags, a parameter file, and the
/// environment. Raw values are strings; coercion happens against the
/// declared parameter type during resolution.
#[derive(Debug, Default, Clone)]
pub struct ParameterValues {
    values: BTreeMap<String, String>,
}

impl ParameterValues {
    /// Creates an empty value set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Merges `key=value` pairs from CLI `--param` flags. CLI values take
    /// precedence over everything merged before them.
    ///
    /// # Errors
    ///
    /// Returns an error if a pair is not in `key=value` form.
    pub fn merge_cli_args(&mut self, args: &[String]) -> Result<()> {
        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                return Err(StrataError::Template(TemplateError::validation(
                    format!("Invalid --param '{arg}'. Expected format: key=value"),
                    "param",
                )));
            };
            self.values.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Merges values from a YAML parameter file (a flat `name: value`
    /// mapping). Existing values are not overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Loading parameter file: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Template(TemplateError::ParseError {
                message: format!("Failed to read parameter file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let parsed: BTreeMap<String, Value> = serde_yaml::from_str(&content).map_err(|e| {
            StrataError::Template(TemplateError::ParseError {
                message: format!("Parameter file parse error: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        for (key, value) in parsed {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            self.values.entry(key).or_insert(rendered);
        }
        Ok(())
    }

    /// Merges values from `STRATA_PARAM_<NAME>` environment variables.
    /// Existing values are not overwritten.
    pub fn merge_env(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(PARAM_ENV_PREFIX) {
                debug!("Parameter '{}' supplied from environment", name.to_lowercase());
                self.values
                    .entry(name.to_lowercase())
                    .or_insert(value);
            }
        }
    }

    /// Gets a raw parameter value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Parser for loading and resolving deployment templates.
#[derive(Debug, Default)]
pub struct TemplateParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl TemplateParser {
    /// Creates a new template parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a template set from a path. A directory loads every `.yaml` /
    /// `.yml` file inside it (sorted by name) as one merged set.
    ///
    /// # Errors
    ///
    /// Returns an error if no file can be read or parsed.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<TemplateSet> {
        let path = path.as_ref();
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext == "yaml" || ext == "yml")
                })
                .collect();
            files.sort();

            if files.is_empty() {
                return Err(StrataError::Template(TemplateError::FileNotFound {
                    path: path.to_path_buf(),
                }));
            }
            return self.load_files(&files);
        }
        self.load_file(path)
    }

    /// Loads a template set from a single YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<TemplateSet> {
        let path = path.as_ref();
        info!("Loading template from: {}", path.display());

        if !path.exists() {
            return Err(StrataError::Template(TemplateError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Template(TemplateError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Loads and merges several template files into one set. The project
    /// block comes from the first file; resources, parameters, and outputs
    /// accumulate across all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be read or parsed.
    pub fn load_files(&self, paths: &[PathBuf]) -> Result<TemplateSet> {
        let mut iter = paths.iter();
        let first = iter.next().ok_or_else(|| {
            StrataError::Template(TemplateError::validation_general(
                "No template files supplied",
            ))
        })?;

        let mut merged = self.load_file(first)?;
        for path in iter {
            let next = self.load_file(path)?;
            merged.parameters.extend(next.parameters);
            merged.resources.extend(next.resources);
            merged.outputs.extend(next.outputs);
        }
        Ok(merged)
    }

    /// Parses a template set from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<TemplateSet> {
        debug!("Parsing YAML template");

        let template: TemplateSet = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StrataError::Template(TemplateError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed template for project '{}' with {} resources",
            template.project.name,
            template.resources.len()
        );
        Ok(template)
    }

    /// Resolves every `${param:...}` placeholder in the template against the
    /// supplied values, coercing and constraint-checking each parameter
    /// against its declaration. After this call the template contains only
    /// resource references.
    ///
    /// # Errors
    ///
    /// Returns an error on missing parameters, constraint violations, or
    /// placeholders naming undeclared parameters.
    pub fn resolve_parameters(
        &self,
        template: &mut TemplateSet,
        supplied: &ParameterValues,
    ) -> Result<()> {
        let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
        for spec in &template.parameters {
            let value = Self::resolve_parameter(spec, supplied.get(&spec.name))?;
            resolved.insert(spec.name.clone(), value);
        }

        for resource in &mut template.resources {
            for value in resource.properties.values_mut() {
                substitute_params(value, &resolved)?;
            }
            if let Some(scope) = &mut resource.scope {
                *scope = substitute_params_str(scope, &resolved)?;
            }
            if let Some(parent) = &mut resource.parent {
                *parent = substitute_params_str(parent, &resolved)?;
            }
            if let Some(target) = &mut resource.target {
                *target = substitute_params_str(target, &resolved)?;
            }
            if let Some(lookup_id) = &mut resource.lookup_id {
                *lookup_id = substitute_params_str(lookup_id, &resolved)?;
            }
            for dep in &mut resource.depends_on {
                *dep = substitute_params_str(dep, &resolved)?;
            }
            resource.name = substitute_params_str(&resource.name, &resolved)?;
        }

        for output in &mut template.outputs {
            output.resource = substitute_params_str(&output.resource, &resolved)?;
        }

        debug!("Resolved {} parameters", resolved.len());
        Ok(())
    }

    /// Resolves a single parameter to its typed value.
    fn resolve_parameter(spec: &ParameterSpec, supplied: Option<&str>) -> Result<Value> {
        let value = match supplied {
            Some(raw) => coerce_parameter(spec, raw)?,
            None => spec.default.clone().ok_or_else(|| {
                StrataError::Template(TemplateError::MissingParameter {
                    name: spec.name.clone(),
                })
            })?,
        };

        check_constraints(spec, &value)?;
        Ok(value)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StrataError::Template(TemplateError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider API token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn get_api_token() -> Result<String> {
        std::env::var("STRATA_API_TOKEN").map_err(|_| {
            StrataError::Template(TemplateError::MissingEnvVar {
                name: String::from("STRATA_API_TOKEN"),
            })
        })
    }

    /// Gets the provider control-plane endpoint override, if set.
    #[must_use]
    pub fn get_endpoint() -> Option<String> {
        std::env::var("STRATA_ENDPOINT").ok()
    }
}

/// Coerces a raw string value to the parameter's declared type.
fn coerce_parameter(spec: &ParameterSpec, raw: &str) -> Result<Value> {
    match spec.param_type {
        ParameterType::String => Ok(Value::String(raw.to_string())),
        ParameterType::Int => raw.parse::<i64>().map(Value::from).map_err(|_| {
            StrataError::Template(TemplateError::ParameterConstraint {
                name: spec.name.clone(),
                constraint: format!("expected an integer, got '{raw}'"),
            })
        }),
        ParameterType::Bool => match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(StrataError::Template(TemplateError::ParameterConstraint {
                name: spec.name.clone(),
                constraint: format!("expected 'true' or 'false', got '{raw}'"),
            })),
        },
    }
}

/// Checks a resolved value against the parameter's declared constraints.
fn check_constraints(spec: &ParameterSpec, value: &Value) -> Result<()> {
    if let Value::String(s) = value {
        if let Some(min) = spec.min_length
            && s.len() < min
        {
            return Err(StrataError::Template(TemplateError::ParameterConstraint {
                name: spec.name.clone(),
                constraint: format!("length {} is below min_length {min}", s.len()),
            }));
        }
        if let Some(max) = spec.max_length
            && s.len() > max
        {
            return Err(StrataError::Template(TemplateError::ParameterConstraint {
                name: spec.name.clone(),
                constraint: format!("length {} exceeds max_length {max}", s.len()),
            }));
        }
    }

    if !spec.allowed.is_empty() && !spec.allowed.contains(value) {
        return Err(StrataError::Template(TemplateError::ParameterConstraint {
            name: spec.name.clone(),
            constraint: format!("value {value} is not in the allowed set"),
        }));
    }

    Ok(())
}

/// Substitutes `${param:...}` placeholders in a property value, recursing
/// through mappings and sequences. A string consisting of exactly one
/// parameter placeholder takes the parameter's typed value.
fn substitute_params(value: &mut Value, params: &BTreeMap<String, Value>) -> Result<()> {
    let whole = match &*value {
        Value::String(s) => whole_param_placeholder(s),
        _ => None,
    };
    if let Some(name) = whole {
        let resolved = params
            .get(&name)
            .ok_or_else(|| StrataError::Template(TemplateError::MissingParameter { name }))?;
        *value = resolved.clone();
        return Ok(());
    }

    match value {
        Value::String(s) => *s = substitute_params_str(s, params)?,
        Value::Array(items) => {
            for item in items {
                substitute_params(item, params)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_params(item, params)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Substitutes `${param:...}` placeholders inside a string, leaving resource
/// references untouched. Works on raw substrings so parameters nested inside
/// resource references (`${storage.account/${param:name}:id}`) resolve too.
fn substitute_params_str(input: &str, params: &BTreeMap<String, Value>) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${param:") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 8..];
        let Some(end) = after.find('}') else {
            return Err(StrataError::Template(TemplateError::InvalidReference {
                placeholder: rest[start..].to_string(),
            }));
        };
        let name = &after[..end];
        let resolved = params.get(name).ok_or_else(|| {
            StrataError::Template(TemplateError::MissingParameter {
                name: name.to_string(),
            })
        })?;
        match resolved {
            Value::String(s) => output.push_str(s),
            other => output.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Returns the parameter name if the whole string is one `${param:...}`.
fn whole_param_placeholder(s: &str) -> Option<String> {
    let inner = s.strip_prefix("${param:")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains('}') || inner.contains("${") {
        return None;
    }
    Some(inner.to_string())
}

/// Default template file names to search for.
pub const DEFAULT_TEMPLATE_FILES: &[&str] = &[
    "strata.deploy.yaml",
    "strata.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the template file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no template file is found.
pub fn find_template_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_TEMPLATE_FILES {
            let template_path = current.join(filename);
            if template_path.exists() {
                info!("Found template file: {}", template_path.display());
                return Ok(template_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StrataError::Template(TemplateError::FileNotFound {
        path: start.join(DEFAULT_TEMPLATE_FILES[0]),
    }))
}
