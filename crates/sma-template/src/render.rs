use std::path::Path;

use sma_core::{Metadata, TemplateError, NAME_VARIABLE};

use crate::template::Template;

const SEPARATORS: [char; 2] = ['/', '\\'];

/// Resolve a location template into a relative directory path.
pub fn render_location(template: &str, vars: &Metadata) -> Result<String, TemplateError> {
    let parsed = Template::parse(template)?;
    let location = parsed.render(vars)?;
    validate_location(&location)?;
    Ok(location)
}

/// Resolve a filename template into a single path component.
///
/// The separator check runs on the raw template before anything is
/// substituted, and again on the rendered output so a metadata value cannot
/// introduce one.
pub fn render_filename(template: &str, vars: &Metadata) -> Result<String, TemplateError> {
    let parsed = check_filename_template(template)?;
    let filename = parsed.render(vars)?;

    if filename.contains(SEPARATORS) {
        return Err(TemplateError::InvalidFilename {
            template: template.to_string(),
            reason: format!("rendered filename `{}` contains a path separator", filename),
        });
    }
    if filename.trim().is_empty() {
        return Err(TemplateError::Empty { template: template.to_string() });
    }
    if filename == "." || filename == ".." {
        return Err(TemplateError::InvalidFilename {
            template: template.to_string(),
            reason: format!("rendered filename `{}` is not a file name", filename),
        });
    }
    Ok(filename)
}

/// Everything about a filename template that can be checked without
/// variables. Config validation calls this up front.
pub fn check_filename_template(template: &str) -> Result<Template, TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty { template: template.to_string() });
    }
    if template.contains(SEPARATORS) {
        return Err(TemplateError::InvalidFilename {
            template: template.to_string(),
            reason: "filename templates must not contain `/` or `\\`".to_string(),
        });
    }
    let parsed = Template::parse(template)?;
    let occurrences = parsed.occurrences(NAME_VARIABLE);
    if occurrences != 1 {
        return Err(TemplateError::MissingRequiredVariable {
            variable: NAME_VARIABLE.to_string(),
            template: template.to_string(),
            occurrences,
        });
    }
    Ok(parsed)
}

/// Locations are relative and never climb out of the output root.
pub fn validate_location(location: &str) -> Result<(), TemplateError> {
    let unsafe_location = |reason: &str| TemplateError::UnsafeLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    };
    if location.trim().is_empty() {
        return Err(unsafe_location("location is empty"));
    }
    if location.starts_with(SEPARATORS) || Path::new(location).is_absolute() || has_drive_prefix(location) {
        return Err(unsafe_location("location must be relative"));
    }
    if location.split(SEPARATORS).any(|part| part == "..") {
        return Err(unsafe_location("location contains a `..` component"));
    }
    Ok(())
}

fn has_drive_prefix(location: &str) -> bool {
    let bytes = location.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Join a rendered location and filename with exactly one `/` between them.
pub fn join_artifact_path(location: &str, filename: &str) -> String {
    if location.ends_with(SEPARATORS) {
        format!("{}{}", location, filename)
    } else {
        format!("{}/{}", location, filename)
    }
}
