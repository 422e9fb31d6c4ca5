//! Payment field extraction from OCR text using regex patterns.
//!
//! Pure functions, no async. Every pattern runs over the whole text and
//! keeps all non-overlapping matches in order of appearance. Matches are
//! returned raw: no deduplication, no normalization.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The payment slip fields we look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Digitable line: `NNNNN.NNNNN NNNNN.NNNNNN NNNNN.NNNNNN N N...`.
    PaymentReference,
    /// `R$ 1.234,56` style amounts, two decimal digits required.
    Amount,
    /// `DD/MM/YYYY` or `YYYY-MM-DD`, with `-` or `/`.
    DueDate,
    /// CNPJ: `NN.NNN.NNN/NNNN-NN`.
    TaxId,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::PaymentReference,
        Field::Amount,
        Field::DueDate,
        Field::TaxId,
    ];

    /// Key used in the JSON result.
    pub fn key(&self) -> &'static str {
        match self {
            Field::PaymentReference => "paymentReference",
            Field::Amount => "amount",
            Field::DueDate => "dueDate",
            Field::TaxId => "taxId",
        }
    }

    /// Boundaries are ASCII-only: an accented letter right before a
    /// digit still separates words (`nº12.345.678/0001-99`).
    fn pattern(&self) -> &'static str {
        match self {
            Field::PaymentReference => {
                r"[0-9]{5}\.[0-9]{5}\s[0-9]{5}\.[0-9]{6}\s[0-9]{5}\.[0-9]{6}\s[0-9]\s[0-9]+"
            }
            Field::Amount => {
                r"(?-u:\b)(?:R\$\s*)?[0-9]{1,3}(?:\.[0-9]{3})*(?:,[0-9]{2})(?-u:\b)"
            }
            Field::DueDate => {
                r"(?-u:\b)(?:[0-9]{2}[-/][0-9]{2}[-/][0-9]{4}|[0-9]{4}[-/][0-9]{2}[-/][0-9]{2})(?-u:\b)"
            }
            Field::TaxId => r"(?-u:\b)[0-9]{2}\.[0-9]{3}\.[0-9]{3}/[0-9]{4}-[0-9]{2}(?-u:\b)",
        }
    }
}

struct CompiledPattern {
    field: Field,
    regex: Regex,
}

static PATTERNS: Lazy<Vec<CompiledPattern>> = Lazy::new(|| {
    Field::ALL
        .iter()
        .map(|&field| CompiledPattern {
            field,
            regex: Regex::new(field.pattern()).unwrap(),
        })
        .collect()
});

/// Candidate values per field, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub payment_reference: Vec<String>,
    pub amount: Vec<String>,
    pub due_date: Vec<String>,
    pub tax_id: Vec<String>,
}

impl ExtractionResult {
    pub fn get(&self, field: Field) -> &[String] {
        match field {
            Field::PaymentReference => &self.payment_reference,
            Field::Amount => &self.amount,
            Field::DueDate => &self.due_date,
            Field::TaxId => &self.tax_id,
        }
    }

    fn slot(&mut self, field: Field) -> &mut Vec<String> {
        match field {
            Field::PaymentReference => &mut self.payment_reference,
            Field::Amount => &mut self.amount,
            Field::DueDate => &mut self.due_date,
            Field::TaxId => &mut self.tax_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|&f| self.get(f).is_empty())
    }
}

/// Run every field pattern over `text`.
pub fn extract_fields(text: &str) -> ExtractionResult {
    let mut result = ExtractionResult::default();

    for pattern in PATTERNS.iter() {
        let values = pattern
            .regex
            .find_iter(text)
            .map(|m| m.as_str().to_string());
        result.slot(pattern.field).extend(values);
    }

    debug!(
        "Extracted fields: {} references, {} amounts, {} due dates, {} tax ids",
        result.payment_reference.len(),
        result.amount.len(),
        result.due_date.len(),
        result.tax_id.len()
    );
    result
}
