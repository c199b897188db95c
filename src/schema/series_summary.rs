// src/schema/series_summary.rs
//
// World Bank WDI series metadata (WDISeries.csv). Column order here is the
// output CSV order and the table column order.

use once_cell::sync::Lazy;

use super::types::{Field, RenameMap, TargetSchema};

/// Name the trailing empty header cell of WDISeries.csv reads as.
pub const COLUMN_TO_REMOVE: &str = "Unnamed: 20";

/// (source header, field name, description)
const COLUMNS: &[(&str, &str, &str)] = &[
    (
        "Series Code",
        "series_code",
        "A number or a sequence of related statistical units arranged or occurring in temporal spatial or other order or succession. WDI carries mostly time series.",
    ),
    (
        "Topic",
        "topic",
        "The matter dealt with in the context discourse or subject related to the series.",
    ),
    ("Indicator Name", "indicator_name", "Given name of a series."),
    (
        "Short definition",
        "short_definition",
        "Short statement of the exact meaning of a series.",
    ),
    (
        "Long definition",
        "long_definition",
        "Extended statement of the exact meaning of a series.",
    ),
    (
        "Unit of measure",
        "unit_of_measure",
        "A quantity used as a standard of measurement. Example: Units of time are second minute hour day week month year and decade.",
    ),
    (
        "Periodicity",
        "periodicity",
        "Applies to series recurring at regular intervals. Most of the time this term denotes that interval of recurrence.",
    ),
    (
        "Base Period",
        "base_period",
        "Base period is the period of time for which data is used as the base of an index number or other ratio have been collected. This period is frequently one of a year but it may be as short as one day or as long as the average of a group of years.",
    ),
    (
        "Other notes",
        "other_notes",
        "A brief record of facts topics or thoughts written down and used to contextualize the series definition values and other characteristics.",
    ),
    (
        "Aggregation method",
        "aggregation_method",
        "Aggregation methods are types of calculations used to group attribute values into a metric for each dimension value. For example for each region one may retrieve the total value of country entries (the sum of the series value for countries belonging to the region).",
    ),
    (
        "Limitations and exceptions",
        "limitations_and_exceptions",
        "A limiting rule or circumstance that applies to usage of the series such as the scope of the survey collecting the data or missing years and countries.  It should also note when data are imputed or estimated",
    ),
    (
        "Notes from original source",
        "notes_from_original_source",
        "A brief record of facts topics or thoughts written down and used to contextualize the series definition values and other characteristics.",
    ),
    (
        "General comments",
        "general_comments",
        "Other notes regarding the series which do not appear in Development relevance or Limitations or exceptions",
    ),
    (
        "Source",
        "source",
        "A place person or organization from which the series comes or can be obtained.",
    ),
    (
        "Statistical concept and methodology",
        "statistical_concept_and_methodology",
        "The abstract idea general statistical notions or a system of methods used to generate the series.",
    ),
    (
        "Development relevance",
        "development_relevance",
        "The relevance of a series refers to how the indicator’s data may be used to monitor particular aspects of development goals and programs for example the Sustainable Development Goals. The indicator may conclusively measure progress towards a particular objective or may act as a proxy or interpretation of a development aim.",
    ),
    (
        "Related source links",
        "related_source_links",
        "Internet address of related source page tool or knowledge base.",
    ),
    (
        "Other web links",
        "other_web_links",
        "Internet addresses of related pages tools or knowledge bases.",
    ),
    (
        "Related indicators",
        "related_indicators",
        "In general indicator that are of interest and related to the specific series.",
    ),
    (
        "License Type",
        "license_type",
        "Explains the rights conferred and restrictions imposed by the owner to the users of a series",
    ),
];

static RENAME: Lazy<RenameMap> = Lazy::new(|| {
    RenameMap::new(
        COLUMNS
            .iter()
            .map(|(from, to, _)| (from.to_string(), to.to_string()))
            .collect(),
    )
    .expect("series summary rename map should be valid")
});

static SCHEMA: Lazy<TargetSchema> = Lazy::new(|| {
    TargetSchema::new(
        COLUMNS
            .iter()
            .map(|(_, name, description)| Field::nullable_string(name, description))
            .collect(),
    )
    .expect("series summary schema should be valid")
});

pub fn rename_map() -> &'static RenameMap {
    &RENAME
}

pub fn schema() -> &'static TargetSchema {
    &SCHEMA
}

/// `CSV_HEADERS`: the output header row.
pub fn csv_headers() -> Vec<String> {
    COLUMNS.iter().map(|(_, name, _)| name.to_string()).collect()
}
