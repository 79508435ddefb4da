//! CSV import/export for patient records.
//!
//! The clinic's spreadsheets come from several export tools: comma or
//! semicolon delimited, with or without a BOM, headers ranging from clean
//! machine names ("phone") to full survey questions ("Qual o seu WhatsApp
//! para contato?"). Parsing therefore detects the delimiter, honors
//! RFC4180-style quoting, and resolves each field through a cascade of
//! header aliases. Export writes a fixed narrow column set meant as an
//! operational extract, not a backup.

use chrono::NaiveDate;

use crate::models::{FinancialStatus, Patient, TreatmentStatus};
use crate::quick_context;

/* -------------------------
   Low-level parsing
--------------------------*/

/// Count unescaped commas vs semicolons on the first line; semicolon wins
/// only when it strictly outnumbers commas (regional spreadsheet exports).
fn detect_delimiter(content: &str) -> char {
    let mut commas = 0usize;
    let mut semicolons = 0usize;
    let mut in_quotes = false;

    for c in content.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => commas += 1,
            ';' if !in_quotes => semicolons += 1,
            '\n' | '\r' if !in_quotes => break,
            _ => {}
        }
    }

    if semicolons > commas { ';' } else { ',' }
}

/// Tokenize into rows of cells. Doubled quotes inside a quoted field are a
/// literal quote; delimiters and newlines inside quotes do not terminate
/// anything. Recognizes `\n`, `\r\n` and bare `\r`. Blank rows are dropped.
fn parse_records(content: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                if !is_blank_row(&row) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            c if c == delimiter => row.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    // Last row may end without a newline.
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        if !is_blank_row(&row) {
            rows.push(row);
        }
    }

    rows
}

fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

/* -------------------------
   Header resolution
--------------------------*/

/// Fold for header matching: diacritics stripped, lower-cased, everything
/// that is not alphanumeric removed.
pub fn normalize_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars().flat_map(char::to_lowercase) {
        let folded = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        };
        if folded.is_alphanumeric() {
            out.push(folded);
        }
    }
    out
}

/// A parsed CSV file: trimmed headers plus data rows mapped positionally.
#[derive(Debug, Default)]
pub struct CsvTable {
    headers: Vec<String>,
    normalized_headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Parse raw file content. Header-only or empty input yields an empty table,
/// not an error.
pub fn parse(content: &str) -> CsvTable {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let delimiter = detect_delimiter(content);
    let mut records = parse_records(content, delimiter);

    if records.len() < 2 {
        return CsvTable::default();
    }

    let headers: Vec<String> = records
        .remove(0)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    let normalized_headers = headers.iter().map(|h| normalize_key(h)).collect();

    CsvTable {
        headers,
        normalized_headers,
        rows: records,
    }
}

impl CsvTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = CsvRecord<'_>> {
        self.rows.iter().map(move |cells| CsvRecord { table: self, cells })
    }
}

pub struct CsvRecord<'a> {
    table: &'a CsvTable,
    cells: &'a [String],
}

impl CsvRecord<'_> {
    fn cell(&self, index: usize) -> &str {
        // Missing trailing cells read as empty.
        self.cells.get(index).map(String::as_str).unwrap_or("")
    }

    /// Resolve a field through candidate header aliases. Per alias, in
    /// order: exact header match, normalized match, substring match in
    /// either direction on the normalized forms. The first alias that
    /// yields a non-empty value wins.
    pub fn value(&self, aliases: &[&str]) -> Option<String> {
        for alias in aliases {
            if let Some(v) = self.resolve_alias(alias) {
                return Some(v);
            }
        }
        None
    }

    fn resolve_alias(&self, alias: &str) -> Option<String> {
        if let Some(i) = self.table.headers.iter().position(|h| h == alias) {
            if let Some(v) = non_empty(self.cell(i)) {
                return Some(v);
            }
        }

        let key = normalize_key(alias);
        if key.is_empty() {
            return None;
        }

        if let Some(i) = self
            .table
            .normalized_headers
            .iter()
            .position(|h| *h == key)
        {
            if let Some(v) = non_empty(self.cell(i)) {
                return Some(v);
            }
        }

        for (i, header) in self.table.normalized_headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            if header.contains(&key) || key.contains(header.as_str()) {
                if let Some(v) = non_empty(self.cell(i)) {
                    return Some(v);
                }
            }
        }

        None
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t.to_string()) }
}

/* -------------------------
   Cell coercions
--------------------------*/

/// Trim, drop invisible characters spreadsheets like to smuggle in, and
/// collapse internal whitespace runs.
pub fn clean_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for c in raw.chars() {
        if c.is_control() || matches!(c, '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}') {
            continue;
        }
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}

/// Keep only digits, preserving a single leading plus.
pub fn clean_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut out = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        out.push('+');
    }
    out.extend(trimmed.chars().filter(char::is_ascii_digit));
    out
}

const TRUTHY_TOKENS: [&str; 5] = ["true", "1", "sim", "yes", "y"];

pub fn parse_bool(raw: &str) -> bool {
    let t = raw.trim().to_lowercase();
    TRUTHY_TOKENS.contains(&t.as_str())
}

/// Decimal with comma or dot separator; currency prefix tolerated.
/// Unparsable input is `None`, never zero.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let t = raw.trim().trim_start_matches("R$").trim();
    if t.is_empty() {
        return None;
    }
    let normalized = if t.contains(',') {
        // "1.234,56" style: dots are thousands separators.
        t.replace('.', "").replace(',', ".")
    } else {
        t.to_string()
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_int(raw: &str) -> Option<i32> {
    let t = raw.trim();
    t.parse::<i32>()
        .ok()
        .or_else(|| parse_decimal(t).map(|v| v as i32))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(t, "%d/%m/%Y"))
        .ok()
}

/* -------------------------
   Row → patient mapping
--------------------------*/

const NAME_ALIASES: &[&str] = &[
    "Nome",
    "Nome Completo",
    "Paciente",
    "name",
    "Qual é o seu nome completo?",
];
const PHONE_ALIASES: &[&str] = &[
    "Telefone",
    "Celular",
    "WhatsApp",
    "phone",
    "Qual o seu WhatsApp para contato?",
];
const EMAIL_ALIASES: &[&str] = &["Email", "E-mail", "email", "Qual o seu e-mail?"];
const BIRTH_DATE_ALIASES: &[&str] = &["Data de Nascimento", "Nascimento", "birth_date"];
const LEAD_SOURCE_ALIASES: &[&str] = &[
    "Origem",
    "Origem do Lead",
    "lead_source",
    "Como você nos conheceu?",
];
const SCHEDULED_ALIASES: &[&str] = &[
    "Agendou",
    "Consulta Agendada",
    "scheduled_appointment",
    "Você já agendou sua avaliação?",
];
const TREATMENT_STATUS_ALIASES: &[&str] = &[
    "Status do Tratamento",
    "Etapa",
    "Status",
    "treatment_status",
];
const PAYMENT_ALIASES: &[&str] = &[
    "Modalidade de Pagamento",
    "Modalidade",
    "payment_modality",
];
const SESSION_VALUE_ALIASES: &[&str] = &["Valor da Sessão", "Valor", "session_value"];
const SUGGESTED_SESSIONS_ALIASES: &[&str] = &["Sessões Sugeridas", "suggested_sessions"];
const FINANCIAL_STATUS_ALIASES: &[&str] = &[
    "Financeiro",
    "Status Financeiro",
    "financial_status",
];
const COMPLAINT_ALIASES: &[&str] = &[
    "Queixa Principal",
    "Queixa",
    "main_complaint",
    "Qual a sua principal queixa ou dor?",
];
const CITY_ALIASES: &[&str] = &["Cidade", "city", "Em qual cidade você mora?"];
const SEX_ALIASES: &[&str] = &["Sexo", "sex", "Qual o seu sexo?"];
const AGE_ALIASES: &[&str] = &["Idade", "age", "Qual a sua idade?"];
const PROFESSION_ALIASES: &[&str] = &["Profissão", "profession", "Qual a sua profissão?"];
const PAIN_REGION_ALIASES: &[&str] = &[
    "Região da Dor",
    "Local da Dor",
    "Em qual região do corpo você sente dor?",
];
const PAIN_DURATION_ALIASES: &[&str] = &[
    "Tempo de Dor",
    "Há quanto tempo você sente essa dor?",
];
const NOTES_ALIASES: &[&str] = &["Observações", "Observacoes", "notes", "Algo mais que gostaria de contar?"];

/// Canonical shape a valid CSV row maps to, ready for persistence.
#[derive(Debug, Clone)]
pub struct PatientDraft {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub lead_source: Option<String>,
    pub scheduled_appointment: bool,
    pub main_complaint: Option<String>,
    pub suggested_sessions: Option<i32>,
    pub treatment_status: Option<TreatmentStatus>,
    pub payment_modality: Option<String>,
    pub session_value: Option<f64>,
    pub financial_status: Option<FinancialStatus>,
    pub quick_context: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParsedImport {
    pub drafts: Vec<PatientDraft>,
    /// Rows dropped for lacking a resolvable name or phone.
    pub skipped: usize,
}

pub fn parse_patients(content: &str) -> ParsedImport {
    let table = parse(content);
    let mut out = ParsedImport::default();

    for record in table.records() {
        match draft_from_record(&record) {
            Some(draft) => out.drafts.push(draft),
            None => out.skipped += 1,
        }
    }

    out
}

fn draft_from_record(record: &CsvRecord<'_>) -> Option<PatientDraft> {
    let name = clean_name(&record.value(NAME_ALIASES)?);
    if name.is_empty() {
        return None;
    }

    let phone = clean_phone(&record.value(PHONE_ALIASES)?);
    if phone.is_empty() {
        return None;
    }

    // Survey-style overflow columns collapse into the quick-context note.
    let mut context_parts: Vec<String> = Vec::new();
    for (label, aliases) in [
        ("Sexo", SEX_ALIASES),
        ("Idade", AGE_ALIASES),
        ("Profissão", PROFESSION_ALIASES),
        ("Região da dor", PAIN_REGION_ALIASES),
        ("Tempo de dor", PAIN_DURATION_ALIASES),
        ("Obs", NOTES_ALIASES),
    ] {
        if let Some(v) = record.value(aliases) {
            context_parts.push(format!("{label}: {v}"));
        }
    }
    let context = if context_parts.is_empty() {
        None
    } else {
        Some(context_parts.join(" | "))
    };

    let city = record.value(CITY_ALIASES);
    let quick_context = quick_context::sync_city(context.as_deref(), city.as_deref());

    Some(PatientDraft {
        name,
        phone,
        email: record.value(EMAIL_ALIASES),
        birth_date: record.value(BIRTH_DATE_ALIASES).and_then(|v| parse_date(&v)),
        lead_source: record.value(LEAD_SOURCE_ALIASES),
        scheduled_appointment: record
            .value(SCHEDULED_ALIASES)
            .map(|v| parse_bool(&v))
            .unwrap_or(false),
        main_complaint: record.value(COMPLAINT_ALIASES),
        suggested_sessions: record
            .value(SUGGESTED_SESSIONS_ALIASES)
            .and_then(|v| parse_int(&v)),
        treatment_status: record
            .value(TREATMENT_STATUS_ALIASES)
            .and_then(|v| TreatmentStatus::parse_loose(&v)),
        payment_modality: record.value(PAYMENT_ALIASES),
        session_value: record
            .value(SESSION_VALUE_ALIASES)
            .and_then(|v| parse_decimal(&v)),
        financial_status: record
            .value(FINANCIAL_STATUS_ALIASES)
            .and_then(|v| FinancialStatus::parse_loose(&v)),
        quick_context,
    })
}

/* -------------------------
   Export
--------------------------*/

/// Export header names deliberately come from the import alias lists so an
/// exported file re-imports cleanly.
const EXPORT_HEADERS: [&str; 6] = [
    "Nome",
    "Telefone",
    "Email",
    "Origem",
    "Status",
    "Financeiro",
];

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Quick operational extract: a fixed narrow column set, not a full backup.
pub fn export_patients(patients: &[Patient]) -> String {
    let mut out = String::new();
    out.push_str(&EXPORT_HEADERS.join(","));
    out.push('\n');

    for p in patients {
        let fields = [
            p.name.as_str(),
            p.phone.as_str(),
            p.email.as_deref().unwrap_or(""),
            p.lead_source.as_str(),
            p.treatment_status.label(),
            p.financial_status.label(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn patient(name: &str, phone: &str, email: Option<&str>) -> Patient {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Patient {
            id: Uuid::new_v4(),
            name: name.to_string(),
            phone: phone.to_string(),
            email: email.map(str::to_string),
            birth_date: None,
            city: None,
            lead_source: "Indicações".to_string(),
            scheduled_appointment: false,
            non_conversion_reason: None,
            main_complaint: None,
            diagnosis: None,
            treatment_objective: None,
            suggested_sessions: None,
            completed_sessions: 0,
            treatment_status: TreatmentStatus::InTreatment,
            payment_modality: "Particular".to_string(),
            session_value: None,
            financial_status: FinancialStatus::Paid,
            anamnesis_link: None,
            quick_context: None,
            sessions: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn semicolon_and_comma_files_parse_identically() {
        let comma = "Nome,Telefone\nAna Souza,11987654321\n";
        let semicolon = "Nome;Telefone\nAna Souza;11987654321\n";

        let a = parse_patients(comma);
        let b = parse_patients(semicolon);

        assert_eq!(a.drafts.len(), 1);
        assert_eq!(b.drafts.len(), 1);
        assert_eq!(a.drafts[0].name, b.drafts[0].name);
        assert_eq!(a.drafts[0].phone, b.drafts[0].phone);
    }

    #[test]
    fn semicolon_needs_strict_majority() {
        // One of each: comma stays the delimiter.
        let content = "Nome,Obs;interna\nAna,\"nota;com ponto e vírgula\"\n";
        let table = parse(content);
        assert_eq!(table.headers, vec!["Nome", "Obs;interna"]);
    }

    #[test]
    fn quoted_fields_keep_delimiters_newlines_and_escaped_quotes() {
        let content =
            "Nome,Telefone,Obs\n\"Souza, Ana\",11987654321,\"linha um\nlinha \"\"dois\"\"\"\n";
        let table = parse(content);
        let record = table.records().next().unwrap();
        assert_eq!(record.value(&["Nome"]).unwrap(), "Souza, Ana");
        assert_eq!(
            record.value(&["Obs"]).unwrap(),
            "linha um\nlinha \"dois\""
        );
    }

    #[test]
    fn bom_blank_rows_and_bare_cr_are_tolerated() {
        let content = "\u{feff}Nome,Telefone\r\n\r\nAna,11987654321\rBia,21912345678";
        let parsed = parse_patients(content);
        assert_eq!(parsed.drafts.len(), 2);
        assert_eq!(parsed.drafts[1].name, "Bia");
    }

    #[test]
    fn header_only_and_empty_files_yield_no_rows() {
        assert!(parse("").is_empty());
        assert!(parse("Nome,Telefone\n").is_empty());
        assert_eq!(parse_patients("Nome,Telefone\n").skipped, 0);
    }

    #[test]
    fn header_alias_cascade_matches_survey_questions() {
        let content = "Qual é o seu nome completo?,Qual o seu WhatsApp para contato?\n\
                       Ana Souza,(11) 98765-4321\n";
        let parsed = parse_patients(content);
        assert_eq!(parsed.drafts.len(), 1);
        assert_eq!(parsed.drafts[0].name, "Ana Souza");
        assert_eq!(parsed.drafts[0].phone, "11987654321");
    }

    #[test]
    fn normalized_match_ignores_case_and_accents() {
        let content = "NOME,TELEFONE,PROFISSÃO\nAna,11987654321,Professora\n";
        let parsed = parse_patients(content);
        assert_eq!(parsed.drafts.len(), 1);
        let ctx = parsed.drafts[0].quick_context.as_deref().unwrap();
        assert!(ctx.contains("Profissão: Professora"));
    }

    #[test]
    fn rows_missing_name_or_phone_are_dropped_and_counted() {
        let content = "Nome,Telefone\n\
                       Ana,11987654321\n\
                       ,11911112222\n\
                       Carla,\n\
                       Dani,21933334444\n";
        let parsed = parse_patients(content);
        assert_eq!(parsed.drafts.len(), 2);
        assert_eq!(parsed.skipped, 2);
    }

    #[test]
    fn name_cleanup_strips_invisible_characters() {
        let content = "Nome,Telefone\n\u{200b} Ana\u{200d}  Souza ,11987654321\n";
        let parsed = parse_patients(content);
        assert_eq!(parsed.drafts[0].name, "Ana Souza");
    }

    #[test]
    fn truthy_tokens_and_decimal_separators() {
        for token in ["true", "SIM", "1", "Yes", "y"] {
            assert!(parse_bool(token), "{token} should be truthy");
        }
        for token in ["nao", "false", "0", "", "maybe"] {
            assert!(!parse_bool(token), "{token} should be falsy");
        }

        assert_eq!(parse_decimal("120,50"), Some(120.50));
        assert_eq!(parse_decimal("120.50"), Some(120.50));
        assert_eq!(parse_decimal("R$ 1.200,00"), Some(1200.0));
        assert_eq!(parse_decimal("grátis"), None);
        assert_eq!(parse_int("10"), Some(10));
        assert_eq!(parse_int("dez"), None);
    }

    #[test]
    fn survey_columns_fold_into_quick_context_with_city_token() {
        let content = "Nome,Telefone,Cidade,Sexo,Idade\n\
                       Ana,11987654321,Santos,F,34\n";
        let parsed = parse_patients(content);
        let ctx = parsed.drafts[0].quick_context.as_deref().unwrap();
        assert!(ctx.starts_with("Cidade: Santos"));
        assert!(ctx.contains("Sexo: F"));
        assert!(ctx.contains("Idade: 34"));
        assert_eq!(ctx.matches(" | ").count(), 2);
    }

    #[test]
    fn export_round_trips_through_import() {
        let patients = vec![
            patient("Souza, Ana", "11987654321", Some("ana@example.com")),
            patient("Bia \"Bi\" Lima", "21912345678", None),
        ];
        let csv = export_patients(&patients);
        let parsed = parse_patients(&csv);

        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.drafts.len(), patients.len());
        for (draft, original) in parsed.drafts.iter().zip(&patients) {
            assert_eq!(draft.name, original.name);
            assert_eq!(draft.phone, original.phone);
            assert_eq!(draft.email, original.email);
            assert_eq!(draft.lead_source.as_deref(), Some("Indicações"));
            assert_eq!(draft.treatment_status, Some(original.treatment_status));
            assert_eq!(draft.financial_status, Some(original.financial_status));
        }
    }
}
