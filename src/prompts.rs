//! Repair Prompt Builder
//!
//! Builds the first generation request and the two repair flavors: a compact
//! one after a crash and a larger one after an empty result. Repairs carry the
//! previous script and excerpts of what it printed, never earlier prompts.

use crate::binder::Bindings;
use crate::classifier::{DistanceSide, FailureCategory};
use crate::dataset::Location;
use crate::llm::CompletionRequest;
use lazy_static::lazy_static;
use regex::Regex;

/// Leading characters of an error message kept in a repair prompt
pub const ERROR_MESSAGE_LIMIT: usize = 1000;
/// Trailing characters of captured output kept in a repair prompt
pub const DIAGNOSTIC_TAIL_LIMIT: usize = 1000;
/// Characters of a dataset analysis kept in the schema summary
pub const ANALYSIS_LIMIT: usize = 200;

pub const TRUNCATION_NOTICE: &str = "... [ERROR MESSAGE TRUNCATED - TOO LONG]";

const SYSTEM_PROMPT: &str = "You are an expert geospatial data analyst. You write Python scripts \
with pandas, geopandas and shapely that answer questions about a city using the datasets you are given.";

const CODE_ONLY: &str = "Respond with the complete Python script only. No explanations, no markdown.";

lazy_static! {
    static ref LINE_REFERENCE: Regex = Regex::new(r"\bline (\d+)").unwrap();
}

/// What every prompt of one run shares
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub question: &'a str,
    pub bindings: &'a Bindings<'a>,
    pub locations: &'a [Location],
}

/// Repair prompt builder
#[derive(Debug, Clone)]
pub struct RepairPromptBuilder {
    artifact_name: String,
}

impl RepairPromptBuilder {
    pub fn new(artifact_name: impl Into<String>) -> Self {
        Self {
            artifact_name: artifact_name.into(),
        }
    }

    /// Request for the first script of a run
    pub fn generation_request(&self, ctx: &PromptContext<'_>) -> CompletionRequest {
        let mut parts = Vec::new();

        parts.push(format!("ORIGINAL USER QUESTION: \"{}\"", ctx.question));
        parts.push(String::new());
        parts.push("AVAILABLE DATASETS:".to_string());
        parts.push(schema_summary(ctx.bindings));
        parts.push("TARGET LOCATIONS:".to_string());
        parts.push(locations_block(ctx.locations));
        parts.push(String::new());
        parts.push("REQUIREMENTS:".to_string());
        parts.push(format!("1. {}", bindings_rule(ctx.bindings)));
        parts.push(format!("2. {}", self.output_contract()));
        parts.push("3. Build points as Point(longitude, latitude).".to_string());
        parts.push(format!("4. {}", CRS_RULE));
        parts.push(
            "5. Print a short message when a step comes up empty, e.g. \"No buildings found near location\", \
\"No emission zones found near location\", \"Input dataset is empty\", \"Invalid emission data\" \
or \"Cannot perform matching\"."
                .to_string(),
        );
        parts.push("6. Print the number of rows after every filter.".to_string());
        parts.push(String::new());
        parts.push("FORMATTING RULES:".to_string());
        parts.extend(formatting_rules());
        parts.push(String::new());
        parts.push("Generate ONLY Python code.".to_string());

        self.request(parts)
    }

    /// Compact repair after a crash, a malformed artifact or an upstream failure
    pub fn hard_error_request(
        &self,
        ctx: &PromptContext<'_>,
        script: &str,
        categories: &[FailureCategory],
        error_message: &str,
        diagnostics: &str,
    ) -> CompletionRequest {
        let mut parts = Vec::new();
        let error_message = truncate_head(error_message, ERROR_MESSAGE_LIMIT);

        parts.push("You are debugging Python code that failed to execute. Fix the error and generate corrected code.".to_string());
        parts.push(String::new());
        parts.push(format!("ORIGINAL USER QUESTION: \"{}\"", ctx.question));
        parts.push(String::new());
        parts.push("FAILED CODE:".to_string());
        parts.push(script.to_string());
        parts.push(String::new());
        parts.push("ERROR MESSAGE:".to_string());
        match error_line(&error_message, script) {
            Some(line) => parts.push(format!("{}\n{}", error_message, line)),
            None => parts.push(error_message.clone()),
        }
        parts.push(String::new());
        parts.push(format!("DETECTED FAILURE CATEGORIES: {}", category_list(categories)));
        parts.push(String::new());
        parts.push("AVAILABLE DATASETS:".to_string());
        parts.push(schema_summary(ctx.bindings));

        let diagnostics = tail(diagnostics, DIAGNOSTIC_TAIL_LIMIT).trim();
        if !diagnostics.is_empty() {
            parts.push("OUTPUT BEFORE THE FAILURE:".to_string());
            parts.push(diagnostics.to_string());
            parts.push(String::new());
        }

        parts.push("SPECIFIC ERROR FIXES:".to_string());
        for category in categories {
            parts.extend(guidance(category));
        }
        parts.push(String::new());
        parts.push("DEBUGGING REQUIREMENTS:".to_string());
        parts.push("1. Fix the EXACT issue that caused the failure.".to_string());
        parts.push(format!("2. {}", bindings_rule(ctx.bindings)));
        parts.push(format!("3. {}", self.output_contract()));
        parts.push("4. If the data looks corrupted, add validation and cleaning steps.".to_string());
        parts.extend(formatting_rules());
        parts.push(String::new());
        parts.push("Generate ONLY corrected Python code - NO explanations.".to_string());

        self.request(parts)
    }

    /// Larger repair after a run that left no rows
    pub fn empty_result_request(
        &self,
        ctx: &PromptContext<'_>,
        script: &str,
        categories: &[FailureCategory],
        diagnostics: &str,
    ) -> CompletionRequest {
        let mut parts = Vec::new();

        parts.push("You are fixing code that executed successfully but produced EMPTY RESULTS (0 rows).".to_string());
        parts.push(String::new());
        parts.push(format!("ORIGINAL USER QUESTION: \"{}\"", ctx.question));
        parts.push(String::new());
        parts.push(format!("FAILURE ANALYSIS: {}", failure_analysis(categories)));
        parts.push(String::new());
        parts.push("PREVIOUS CODE:".to_string());
        parts.push(script.to_string());
        parts.push(String::new());
        parts.push("DEBUGGING OUTPUT FROM FAILED ATTEMPT:".to_string());
        let diagnostics = tail(diagnostics, DIAGNOSTIC_TAIL_LIMIT).trim();
        parts.push(if diagnostics.is_empty() {
            "(no output)".to_string()
        } else {
            diagnostics.to_string()
        });
        parts.push(String::new());
        parts.push("AVAILABLE DATASETS:".to_string());
        parts.push(schema_summary(ctx.bindings));
        parts.push("TARGET LOCATIONS:".to_string());
        parts.push(locations_block(ctx.locations));
        parts.push(String::new());
        parts.push("SPECIFIC FIXES FOR EMPTY RESULTS:".to_string());
        for category in categories {
            parts.extend(guidance(category));
        }
        parts.push(String::new());
        parts.push("ENHANCED SOLUTION PATTERN:".to_string());
        parts.push(solution_pattern(ctx));
        parts.push(String::new());
        parts.push("CRITICAL REQUIREMENTS:".to_string());
        parts.push("- INCREASE the distance radius significantly (5-20 km)".to_string());
        parts.push("- ADD bounds checking and coordinate validation".to_string());
        parts.push(format!("- {}", CRS_RULE));
        parts.push(format!("- {}", bindings_rule(ctx.bindings)));
        parts.push(format!("- {}", self.output_contract()));
        parts.push("- KEEP the debugging prints".to_string());
        parts.extend(formatting_rules());
        parts.push(String::new());
        parts.push("Generate ONLY the corrected Python code with these fixes applied.".to_string());

        self.request(parts)
    }

    fn request(&self, parts: Vec<String>) -> CompletionRequest {
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            pre_instruction: Some(CODE_ONLY.to_string()),
            user: parts.join("\n"),
        }
    }

    fn output_contract(&self) -> String {
        format!(
            "Save the final result with result.to_csv('{}', index=False). It must have exactly 3 columns: \
name, longitude, latitude (WGS84 degrees). Write the file even when no rows match.",
            self.artifact_name
        )
    }
}

const CRS_RULE: &str = "Normalize coordinate systems: use .to_crs('EPSG:4326') before comparing or \
reporting coordinates and .to_crs('EPSG:3857') before measuring distances in metres.";

/// Guidance block for one category. The first line names the category.
pub fn guidance(category: &FailureCategory) -> Vec<String> {
    let mut lines = vec![format!("For {}:", category.tag())];
    let body: Vec<String> = match category {
        FailureCategory::SyntaxSpacing => vec![
            "- Replace \"= =\" with \"==\"".to_string(),
            "- Replace \"! =\" with \"!=\"".to_string(),
            "- Replace \"< =\" with \"<=\" and \"> =\" with \">=\"".to_string(),
            "- Check for missing commas, colons or parentheses".to_string(),
            "- Put one space around operators".to_string(),
        ],
        FailureCategory::IndentationMissing => vec![
            "- The line after if:, for:, while:, def:, try: or except: MUST be indented by 4 spaces".to_string(),
            "- Use exactly 4 spaces per level, never tabs".to_string(),
            "- Example:".to_string(),
            "  if condition:".to_string(),
            "      code_here".to_string(),
        ],
        FailureCategory::MalformedExceptionBlock => vec![
            "- Every line of a try block must be indented inside it".to_string(),
            "- WRONG:".to_string(),
            "  try:".to_string(),
            "      line1".to_string(),
            "  line2".to_string(),
            "      except:".to_string(),
            "- CORRECT:".to_string(),
            "  try:".to_string(),
            "      line1".to_string(),
            "      line2".to_string(),
            "  except Exception as e:".to_string(),
            "      print(e)".to_string(),
            "- Or drop the try block and use a plain if statement".to_string(),
        ],
        FailureCategory::NumericConversion => vec![
            "- The column holds text or concatenated values".to_string(),
            "- Convert with pd.to_numeric(column, errors='coerce') and drop NaN rows".to_string(),
            "- Print a few raw values before converting".to_string(),
        ],
        FailureCategory::EmptyResultGeneric { row_counts } => {
            let counts: Vec<String> = row_counts
                .iter()
                .map(|(name, rows)| format!("{}: {} rows", name, rows))
                .collect();
            vec![
                "- The distance radius is likely too small or the location coordinates are wrong".to_string(),
                format!("- Available data: {}", counts.join(", ")),
                "- INCREASE max_distance_km to 10.0 or 20.0".to_string(),
                "- CHECK that the location coordinates are (longitude, latitude)".to_string(),
                "- PRINT dataset bounds to verify spatial overlap".to_string(),
            ]
        }
        FailureCategory::DistanceTooSmall(DistanceSide::Buildings) => vec![
            "- No buildings were found within the radius".to_string(),
            "- INCREASE the radius from 2 km to 5 km or 10 km".to_string(),
            "- CHECK the location coordinates against the question".to_string(),
            "- Use the generic 'building' column instead of specific building types".to_string(),
        ],
        FailureCategory::DistanceTooSmall(DistanceSide::Emissions) => vec![
            "- No emission zones were found within the radius".to_string(),
            "- INCREASE the radius used for emission zones".to_string(),
            "- CHECK that the emission dataset variable name is exactly as listed".to_string(),
        ],
        FailureCategory::EmptyInput => vec![
            "- One or more inputs were empty when the script reached them".to_string(),
            "- CHECK the variable names and print len() of every dataset at the start".to_string(),
            "- Apply filters one at a time and print the row count after each".to_string(),
        ],
        FailureCategory::InvalidEmissionData => vec![
            "- Emission data is missing its geometry column or is empty".to_string(),
            "- Use the already-loaded GeoDataFrame; geometry_wkt has been parsed into .geometry".to_string(),
            "- VERIFY column names match exactly".to_string(),
        ],
        FailureCategory::NoMatchingData => vec![
            "- One side of the proximity match was missing".to_string(),
            "- Relax the filters, or match with gpd.sjoin_nearest instead of a fixed radius".to_string(),
        ],
        FailureCategory::MissingOutputFile => vec![
            "- The script finished without writing the result file".to_string(),
            "- End the script with result.to_csv(...), outside any if/else branch".to_string(),
        ],
        FailureCategory::ExecutionError(msg) => vec![
            format!("- Error details: {}", truncate_head(msg, ERROR_MESSAGE_LIMIT)),
            "- NameError: use the dataset variable names exactly as listed".to_string(),
            "- AttributeError: check column names; use .centroid.x / .centroid.y for non-point geometries"
                .to_string(),
            "- CRS mismatch: call .to_crs('EPSG:4326') on both sides".to_string(),
        ],
        FailureCategory::OutputShape(reason) => vec![
            format!(
                "- The result file was rejected: {}",
                truncate_head(reason, ERROR_MESSAGE_LIMIT)
            ),
            "- Columns must be exactly name, longitude, latitude in that order".to_string(),
            "- longitude is in [-180, 180] and latitude in [-90, 90]; do not swap them".to_string(),
            "- Project back to EPSG:4326 before extracting coordinates".to_string(),
        ],
        FailureCategory::UpstreamUnavailable(msg) => vec![
            format!(
                "- The previous request could not be completed: {}",
                truncate_head(msg, ERROR_MESSAGE_LIMIT)
            ),
            "- Return the complete script, not a fragment".to_string(),
        ],
    };
    lines.extend(body);
    lines
}

/// Name, identifier, rows, columns, spatial flag and analysis of every dataset
pub fn schema_summary(bindings: &Bindings<'_>) -> String {
    let mut out = Vec::new();
    for binding in bindings.iter() {
        let content = &binding.dataset.content;
        let (analysis, cut) = truncate_chars(&binding.dataset.summary, ANALYSIS_LIMIT);
        out.push(format!(
            "Dataset: {}\n- Variable: {}\n- Rows: {}\n- Columns: [{}]\n- Has spatial data: {}\n- Analysis: {}{}\n",
            binding.dataset.name,
            binding.identifier,
            content.row_count(),
            content.columns.join(", "),
            content.is_spatial(),
            analysis,
            if cut { "..." } else { "" }
        ));
    }
    out.join("\n")
}

/// First `max` characters plus a notice when the text is longer
pub fn truncate_head(text: &str, max: usize) -> String {
    let (head, cut) = truncate_chars(text, max);
    if cut {
        format!("{}{}", head, TRUNCATION_NOTICE)
    } else {
        head.to_string()
    }
}

/// Last `max` characters
pub fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// `ERROR LINE n: <source>` when the message points at a line of the script
pub fn error_line(error_message: &str, script: &str) -> Option<String> {
    let number: usize = LINE_REFERENCE
        .captures(error_message)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    let line = script.lines().nth(number.checked_sub(1)?)?;
    Some(format!("ERROR LINE {}: {}", number, line))
}

fn truncate_chars(text: &str, max: usize) -> (&str, bool) {
    match text.char_indices().nth(max) {
        Some((end, _)) => (&text[..end], true),
        None => (text, false),
    }
}

fn bindings_rule(bindings: &Bindings<'_>) -> String {
    format!(
        "Use these EXACT variable names, already loaded: {}. DO NOT load files (no read_csv, read_file or open); the variables are already available.",
        bindings.identifiers().join(", ")
    )
}

fn formatting_rules() -> Vec<String> {
    vec![
        "- Indent with exactly 4 spaces, never tabs".to_string(),
        "- Indent every line after a ':'".to_string(),
        "- Write comparison operators without inner spaces: ==, !=, <=, >=".to_string(),
    ]
}

fn locations_block(locations: &[Location]) -> String {
    if locations.is_empty() {
        return "No specific coordinates provided".to_string();
    }
    locations
        .iter()
        .map(|l| format!("- {}: lat={}, lon={}", l.name, l.lat, l.lon))
        .collect::<Vec<_>>()
        .join("\n")
}

fn category_list(categories: &[FailureCategory]) -> String {
    categories
        .iter()
        .map(|c| c.tag())
        .collect::<Vec<_>>()
        .join(", ")
}

fn failure_analysis(categories: &[FailureCategory]) -> String {
    categories
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

fn solution_pattern(ctx: &PromptContext<'_>) -> String {
    let mut lines = vec![
        "max_distance_km = 10.0  # increased".to_string(),
        "print('Dataset bounds check:')".to_string(),
    ];
    for ident in ctx.bindings.identifiers() {
        lines.push(format!("if hasattr({0}, 'total_bounds'):", ident));
        lines.push(format!("    print('{0} bounds:', {0}.total_bounds)", ident));
    }
    if let Some(location) = ctx.locations.first() {
        lines.push(format!("target_center = Point({}, {})", location.lon, location.lat));
        lines.push("print('Target location:', target_center)".to_string());
    }
    lines.join("\n")
}
