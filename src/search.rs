//! Free-text search and page-number pagination for list screens.
//!
//! A query is split on whitespace. A row matches when every term is
//! contained (case-insensitively) in at least one of the searched fields.

use serde::Serialize;
use sqlx::{Postgres, QueryBuilder};

use crate::models::{Defence, Person, Proposal, Thesis, WithStatus};

pub const DEFAULT_PAGE_LENGTH: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    IdCardNumber,
    Name,
    LastName,
    ProposalCode,
    ProposalTitle,
    ThesisCode,
    ThesisTitle,
    ThesisProposalCode,
    DefenceCode,
    DefenceThesisCode,
}

impl SearchField {
    /// Qualified column, using the aliases of the list queries in `db`.
    pub fn column(self) -> &'static str {
        match self {
            Self::IdCardNumber => "pe.id_card_number",
            Self::Name => "pe.name",
            Self::LastName => "pe.last_name",
            Self::ProposalCode => "p.code",
            Self::ProposalTitle => "p.title",
            Self::ThesisCode => "t.code",
            Self::ThesisTitle => "t.title",
            Self::ThesisProposalCode => "t.proposal_code",
            Self::DefenceCode => "d.code",
            Self::DefenceThesisCode => "d.thesis_code",
        }
    }
}

pub const PERSON_FIELDS: &[SearchField] = &[
    SearchField::IdCardNumber,
    SearchField::Name,
    SearchField::LastName,
];
pub const PROPOSAL_FIELDS: &[SearchField] = &[SearchField::ProposalCode, SearchField::ProposalTitle];
pub const THESIS_FIELDS: &[SearchField] = &[
    SearchField::ThesisCode,
    SearchField::ThesisTitle,
    SearchField::ThesisProposalCode,
];
pub const DEFENCE_FIELDS: &[SearchField] = &[SearchField::DefenceCode, SearchField::DefenceThesisCode];

/// Rows that expose text fields to a [`SearchSpec`].
pub trait Searchable {
    fn field(&self, field: SearchField) -> Option<&str>;
}

impl Searchable for Person {
    fn field(&self, field: SearchField) -> Option<&str> {
        match field {
            SearchField::IdCardNumber => Some(&self.id_card_number),
            SearchField::Name => Some(&self.name),
            SearchField::LastName => Some(&self.last_name),
            _ => None,
        }
    }
}

impl Searchable for Proposal {
    fn field(&self, field: SearchField) -> Option<&str> {
        match field {
            SearchField::ProposalCode => Some(&self.code),
            SearchField::ProposalTitle => Some(&self.title),
            _ => None,
        }
    }
}

impl Searchable for Thesis {
    fn field(&self, field: SearchField) -> Option<&str> {
        match field {
            SearchField::ThesisCode => Some(&self.code),
            SearchField::ThesisTitle => Some(&self.title),
            SearchField::ThesisProposalCode => Some(&self.proposal_code),
            _ => None,
        }
    }
}

impl Searchable for Defence {
    fn field(&self, field: SearchField) -> Option<&str> {
        match field {
            SearchField::DefenceCode => Some(&self.code),
            SearchField::DefenceThesisCode => Some(&self.thesis_code),
            _ => None,
        }
    }
}

impl<T: Searchable> Searchable for WithStatus<T> {
    fn field(&self, field: SearchField) -> Option<&str> {
        self.record.field(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpec {
    fields: Vec<SearchField>,
    terms: Vec<String>,
}

impl SearchSpec {
    pub fn parse(query: Option<&str>, fields: &[SearchField]) -> Self {
        let terms = query
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self {
            fields: fields.to_vec(),
            terms,
        }
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches<T: Searchable>(&self, row: &T) -> bool {
        self.terms.iter().all(|term| {
            let needle = term.to_lowercase();
            self.fields.iter().any(|field| {
                row.field(*field)
                    .map(|value| value.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
        })
    }

    /// Appends ` AND (a ILIKE $n OR b ILIKE $n)` per term. Terms with no
    /// field to search match nothing, as in [`SearchSpec::matches`].
    pub fn push_filter(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if self.terms.is_empty() {
            return;
        }
        if self.fields.is_empty() {
            builder.push(" AND FALSE");
            return;
        }
        for term in &self.terms {
            let pattern = format!("%{}%", escape_like(term));
            builder.push(" AND (");
            for (index, field) in self.fields.iter().enumerate() {
                if index > 0 {
                    builder.push(" OR ");
                }
                builder.push(field.column());
                builder.push(" ILIKE ");
                builder.push_bind(pattern.clone());
            }
            builder.push(")");
        }
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub number: usize,
    pub length: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            number: 1,
            length: DEFAULT_PAGE_LENGTH,
        }
    }
}

/// A page position resolved against a known row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub number: usize,
    pub length: usize,
    pub num_pages: usize,
    pub offset: usize,
}

impl PageRequest {
    pub fn new(number: usize, length: usize) -> Self {
        Self { number, length }
    }

    /// Clamps the requested page into `1..=num_pages`. There is always at
    /// least one (possibly empty) page.
    pub fn resolve(&self, total: usize) -> PageWindow {
        let length = self.length.max(1);
        let num_pages = total.div_ceil(length).max(1);
        let number = self.number.clamp(1, num_pages);
        PageWindow {
            number,
            length,
            num_pages,
            offset: (number - 1) * length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: usize,
    pub length: usize,
    pub total: usize,
    pub num_pages: usize,
}

impl<T> Page<T> {
    pub fn from_window(items: Vec<T>, window: PageWindow, total: usize) -> Self {
        Self {
            items,
            number: window.number,
            length: window.length,
            total,
            num_pages: window.num_pages,
        }
    }

    /// Slices an already filtered and ordered list.
    pub fn paginate(rows: Vec<T>, request: PageRequest) -> Self {
        let total = rows.len();
        let window = request.resolve(total);
        let items = rows
            .into_iter()
            .skip(window.offset)
            .take(window.length)
            .collect();
        Self::from_window(items, window, total)
    }

    pub fn has_next(&self) -> bool {
        self.number < self.num_pages
    }

    pub fn has_previous(&self) -> bool {
        self.number > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str, name: &str, last_name: &str) -> Person {
        Person {
            id_card_number: id.to_string(),
            type_id: 1,
            name: name.to_string(),
            last_name: last_name.to_string(),
            institutional_email: None,
            email: format!("{id}@example.com"),
            primary_phone: "0212-0000000".to_string(),
            secondary_phone: None,
            observations: None,
        }
    }

    #[test]
    fn terms_are_and_ed_and_fields_or_ed() {
        let maria = person("V-1001", "María", "González");
        let mario = person("V-2002", "Mario", "Pérez");

        let spec = SearchSpec::parse(Some("mar gonz"), PERSON_FIELDS);
        assert!(spec.matches(&maria));
        assert!(!spec.matches(&mario));

        let by_card = SearchSpec::parse(Some("2002"), PERSON_FIELDS);
        assert!(by_card.matches(&mario));
        assert!(!by_card.matches(&maria));
    }

    #[test]
    fn blank_query_matches_everything() {
        let spec = SearchSpec::parse(Some("   "), PERSON_FIELDS);
        assert!(spec.is_empty());
        assert!(spec.matches(&person("V-1", "Ana", "Rojas")));
    }

    #[test]
    fn fields_not_searched_are_ignored() {
        let spec = SearchSpec::parse(Some("Rojas"), &[SearchField::Name]);
        assert!(!spec.matches(&person("V-1", "Ana", "Rojas")));
    }

    #[test]
    fn filter_binds_one_placeholder_per_field_and_term() {
        let spec = SearchSpec::parse(Some("a b"), PROPOSAL_FIELDS);
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM thesis_registry.proposals p WHERE TRUE");
        spec.push_filter(&mut builder);
        assert_eq!(
            builder.sql(),
            "SELECT 1 FROM thesis_registry.proposals p WHERE TRUE \
             AND (p.code ILIKE $1 OR p.title ILIKE $2) \
             AND (p.code ILIKE $3 OR p.title ILIKE $4)"
        );
    }

    #[test]
    fn terms_without_fields_match_nothing() {
        let spec = SearchSpec::parse(Some("Rojas"), &[]);
        assert!(!spec.matches(&person("V-1", "Ana", "Rojas")));

        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        spec.push_filter(&mut builder);
        assert_eq!(builder.sql(), "SELECT 1 WHERE TRUE AND FALSE");

        let blank = SearchSpec::parse(None, &[]);
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        blank.push_filter(&mut builder);
        assert_eq!(builder.sql(), "SELECT 1 WHERE TRUE");
        assert!(blank.matches(&person("V-1", "Ana", "Rojas")));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_a\\b"), "50\\%\\_a\\\\b");
    }

    #[test]
    fn out_of_range_pages_clamp() {
        let rows: Vec<u32> = (1..=40).collect();
        let last = Page::paginate(rows.clone(), PageRequest::new(9, 15));
        assert_eq!(last.number, 3);
        assert_eq!(last.items, (31..=40).collect::<Vec<_>>());
        assert!(!last.has_next());
        assert!(last.has_previous());

        let first = Page::paginate(rows, PageRequest::new(0, 15));
        assert_eq!(first.number, 1);
        assert_eq!(first.items.len(), 15);
        assert_eq!(first.num_pages, 3);
    }

    #[test]
    fn empty_result_still_has_one_page() {
        let page = Page::<u32>::paginate(Vec::new(), PageRequest::default());
        assert_eq!(page.num_pages, 1);
        assert_eq!(page.number, 1);
        assert!(page.items.is_empty());
    }
}
