//! Reference placeholder parsing and interpolation.
//!
//! Template values may embed `${...}` placeholders in two forms:
//! `${param:<name>}` for parameters resolved at parse time, and
//! `${<address>:<attribute>}` for attributes of other resources resolved at
//! apply time, once the referenced resource has been applied or looked up.

use serde_json::Value;

use crate::error::TemplateError;

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `${param:<name>}` — a template parameter.
    Param(String),
    /// `${<address>:<attribute>}` — an attribute of another resource.
    Resource {
        /// Address of the referenced resource.
        address: String,
        /// Attribute name on the applied resource.
        attribute: String,
    },
}

/// Extracts every placeholder from a string, left to right.
///
/// # Errors
///
/// Returns an error if a placeholder is unterminated or malformed.
pub fn extract_placeholders(input: &str) -> Result<Vec<Placeholder>, TemplateError> {
    let mut placeholders = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(TemplateError::InvalidReference {
                placeholder: rest[start..].to_string(),
            });
        };
        placeholders.push(parse_placeholder(&after[..end])?);
        rest = &after[end + 1..];
    }

    Ok(placeholders)
}

/// Parses the interior of a single `${...}` placeholder.
fn parse_placeholder(content: &str) -> Result<Placeholder, TemplateError> {
    if let Some(name) = content.strip_prefix("param:") {
        if name.is_empty() {
            return Err(TemplateError::InvalidReference {
                placeholder: format!("${{{content}}}"),
            });
        }
        return Ok(Placeholder::Param(name.to_string()));
    }

    let Some((address, attribute)) = content.rsplit_once(':') else {
        return Err(TemplateError::InvalidReference {
            placeholder: format!("${{{content}}}"),
        });
    };

    if address.is_empty() || attribute.is_empty() || !address.contains('/') {
        return Err(TemplateError::InvalidReference {
            placeholder: format!("${{{content}}}"),
        });
    }

    Ok(Placeholder::Resource {
        address: address.to_string(),
        attribute: attribute.to_string(),
    })
}

/// Collects the addresses of all resource references inside a property
/// value, recursing through mappings and sequences. Malformed placeholders
/// are ignored here; the validator reports them separately.
#[must_use]
pub fn resource_references(value: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    collect_references(value, &mut refs);
    refs
}

fn collect_references(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Ok(placeholders) = extract_placeholders(s) {
                for placeholder in placeholders {
                    if let Placeholder::Resource { address, .. } = placeholder {
                        if !refs.contains(&address) {
                            refs.push(address);
                        }
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, refs);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Interpolates every placeholder in a string using the supplied resolver.
///
/// The resolver returns `None` when it cannot produce a value for a
/// placeholder, which surfaces as an `InvalidReference` error carrying the
/// placeholder text.
///
/// # Errors
///
/// Returns an error on malformed placeholders or unresolvable references.
pub fn interpolate<F>(input: &str, resolver: F) -> Result<String, TemplateError>
where
    F: Fn(&Placeholder) -> Option<String>,
{
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(TemplateError::InvalidReference {
                placeholder: rest[start..].to_string(),
            });
        };
        let placeholder = parse_placeholder(&after[..end])?;
        let Some(resolved) = resolver(&placeholder) else {
            return Err(TemplateError::InvalidReference {
                placeholder: format!("${{{}}}", &after[..end]),
            });
        };
        output.push_str(&resolved);
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_param_placeholder() {
        let placeholders = extract_placeholders("${param:base_name}-suffix").unwrap();
        assert_eq!(
            placeholders,
            vec![Placeholder::Param(String::from("base_name"))]
        );
    }

    #[test]
    fn test_extract_resource_placeholder() {
        let placeholders = extract_placeholders("${storage.account/main:id}").unwrap();
        assert_eq!(
            placeholders,
            vec![Placeholder::Resource {
                address: String::from("storage.account/main"),
                attribute: String::from("id"),
            }]
        );
    }

    #[test]
    fn test_extract_multiple_placeholders() {
        let placeholders =
            extract_placeholders("${network.vnet/main:id}/subnets/${param:subnet_name}").unwrap();
        assert_eq!(placeholders.len(), 2);
    }

    #[test]
    fn test_plain_string_has_no_placeholders() {
        assert!(extract_placeholders("Standard_LRS").unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_placeholder_is_rejected() {
        assert!(extract_placeholders("${storage.account/main:id").is_err());
    }

    #[test]
    fn test_placeholder_without_attribute_is_rejected() {
        assert!(extract_placeholders("${storage.account/main}").is_err());
    }

    #[test]
    fn test_resource_references_recurse_into_nested_values() {
        let value = json!({
            "connections": [
                { "target_id": "${storage.account/main:id}" },
                { "target_id": "${ai.account/brain:id}" },
            ],
            "dns": "${network.dns_zone/private:id}",
        });

        let refs = resource_references(&value);
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&String::from("storage.account/main")));
        assert!(refs.contains(&String::from("ai.account/brain")));
        assert!(refs.contains(&String::from("network.dns_zone/private")));
    }

    #[test]
    fn test_interpolate_replaces_placeholders() {
        let result = interpolate("${storage.account/main:id}/blobServices", |p| match p {
            Placeholder::Resource { address, attribute } => {
                Some(format!("/providers/{address}/{attribute}"))
            }
            Placeholder::Param(_) => None,
        })
        .unwrap();

        assert_eq!(result, "/providers/storage.account/main/id/blobServices");
    }

    #[test]
    fn test_interpolate_fails_on_unresolvable() {
        let result = interpolate("${storage.account/main:id}", |_| None);
        assert!(result.is_err());
    }
}
