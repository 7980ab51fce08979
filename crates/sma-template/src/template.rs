use sma_core::{Metadata, TemplateError};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// A parsed `${variable}` template. `$$` is a literal `$`; any other `$`
/// not followed by `{` is literal text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        if raw.trim().is_empty() {
            return Err(TemplateError::Empty { template: raw.to_string() });
        }

        let malformed = |position| TemplateError::Malformed {
            template: raw.to_string(),
            position,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }
            match chars.peek() {
                Some((_, '$')) => {
                    chars.next();
                    literal.push('$');
                }
                Some((_, '{')) => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, nc) in chars.by_ref() {
                        if nc == '}' {
                            closed = true;
                            break;
                        }
                        name.push(nc);
                    }
                    if !closed || !is_identifier(&name) {
                        return Err(malformed(pos));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var(name));
                }
                _ => literal.push('$'),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Referenced variable names in order of appearance, repeats included.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn occurrences(&self, variable: &str) -> usize {
        self.variables().filter(|v| *v == variable).count()
    }

    /// Substitute every placeholder. A variable missing from `vars` is an
    /// error, never an empty string.
    pub fn render(&self, vars: &Metadata) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(name) => {
                    let value = vars.get(name).ok_or_else(|| TemplateError::Unresolved {
                        variable: name.clone(),
                        template: self.raw.clone(),
                    })?;
                    out.push_str(&value.render());
                }
            }
        }
        Ok(out)
    }

    /// Render with the given variables filled in and every other placeholder
    /// replaced by `wildcard`. Used to build discovery patterns.
    pub fn render_partial(&self, vars: &Metadata, wildcard: &str) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(name) => match vars.get(name) {
                    Some(v) => out.push_str(&v.render()),
                    None => out.push_str(wildcard),
                },
            }
        }
        out
    }

    /// Literal text before the first placeholder, cut back to the last path
    /// separator: the deepest directory every rendering shares.
    pub fn fixed_prefix(&self) -> String {
        let head = match self.segments.first() {
            Some(Segment::Literal(text)) if self.segments.len() > 1 => text.as_str(),
            Some(Segment::Literal(text)) => return text.clone(),
            _ => "",
        };
        match head.rfind(['/', '\\']) {
            Some(idx) => head[..=idx].to_string(),
            None => String::new(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
