//! Entity and relation extraction from chunk text
//!
//! Pattern-based NER with financial-domain rules: tickers, organizations,
//! monetary values, fiscal years, regulations. Relations come from
//! co-occurrence heuristics with confidence scores in [0, 1].

use super::chunker::split_sentences;
use super::graph::{EntityType, RelationType};
use regex::Regex;
use std::collections::HashSet;

/// An extracted entity candidate
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub entity_type: EntityType,
    pub name: String,
    pub aliases: Vec<String>,
}

/// An extracted relation between two entity names
#[derive(Debug, Clone)]
pub struct ExtractedRelation {
    pub src: String,
    pub src_type: EntityType,
    pub dst: String,
    pub dst_type: EntityType,
    pub relation_type: RelationType,
    pub confidence: f64,
}

/// Regex-driven entity extractor
pub struct EntityExtractor {
    ticker_re: Regex,
    org_re: Regex,
    money_re: Regex,
    year_re: Regex,
    regulation_re: Regex,
    known_tickers: HashSet<String>,
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityExtractor {
    pub fn new() -> Self {
        Self {
            // $AAPL or a bare 2-5 letter uppercase token checked against
            // the known set.
            ticker_re: Regex::new(r"\$([A-Z]{1,5})\b|\b([A-Z]{2,5})\b").expect("static regex"),
            org_re: Regex::new(
                r"\b([A-Z][A-Za-z&.]*(?:\s+[A-Z][A-Za-z&.]*){0,4}\s+(?:Inc\.?|Corp\.?|Corporation|Company|Co\.|Ltd\.?|LLC|plc))",
            )
            .expect("static regex"),
            money_re: Regex::new(r"\$[\d,]+(?:\.\d+)?\s*(?:thousand|million|billion)?")
                .expect("static regex"),
            year_re: Regex::new(r"\b(?:fiscal\s+(?:year\s+)?|FY\s?)((?:19|20)\d{2})\b")
                .expect("static regex"),
            regulation_re: Regex::new(
                r"\b((?:[A-Z][A-Za-z-]+\s+)+Act(?:\s+of\s+\d{4})?|Section\s+\d+[A-Za-z]?(?:\([a-z]\))?)",
            )
            .expect("static regex"),
            known_tickers: [
                "AAPL", "MSFT", "AMZN", "GOOGL", "GOOG", "META", "NVDA", "TSLA", "AMD", "INTC",
                "IBM", "ORCL", "CRM", "NFLX", "JPM", "BAC", "GS", "V", "MA",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    /// Extract entities from chunk text
    pub fn extract_entities(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities: Vec<ExtractedEntity> = Vec::new();
        let mut push_unique = |entity: ExtractedEntity| {
            let exists = entities
                .iter()
                .any(|e| e.entity_type == entity.entity_type && e.name == entity.name);
            if !exists {
                entities.push(entity);
            }
        };

        for caps in self.ticker_re.captures_iter(text) {
            if let Some(dollar) = caps.get(1) {
                push_unique(ExtractedEntity {
                    entity_type: EntityType::Organization,
                    name: dollar.as_str().to_string(),
                    aliases: vec![format!("${}", dollar.as_str())],
                });
            } else if let Some(bare) = caps.get(2) {
                if self.known_tickers.contains(bare.as_str()) {
                    push_unique(ExtractedEntity {
                        entity_type: EntityType::Organization,
                        name: bare.as_str().to_string(),
                        aliases: vec![],
                    });
                }
            }
        }

        for caps in self.org_re.captures_iter(text) {
            let name = caps[1].trim().to_string();
            push_unique(ExtractedEntity {
                entity_type: EntityType::Organization,
                name,
                aliases: vec![],
            });
        }

        for m in self.money_re.find_iter(text) {
            push_unique(ExtractedEntity {
                entity_type: EntityType::Metric,
                name: m.as_str().trim().to_string(),
                aliases: vec![],
            });
        }

        for caps in self.year_re.captures_iter(text) {
            push_unique(ExtractedEntity {
                entity_type: EntityType::Concept,
                name: format!("FY{}", &caps[1]),
                aliases: vec![caps[1].to_string()],
            });
        }

        for caps in self.regulation_re.captures_iter(text) {
            push_unique(ExtractedEntity {
                entity_type: EntityType::Regulation,
                name: caps[1].trim().to_string(),
                aliases: vec![],
            });
        }

        entities
    }

    /// Derive relations from sentence-level co-occurrence.
    ///
    /// Organization + Metric in one sentence → REPORTED;
    /// Organization + Regulation → GOVERNED_BY;
    /// Organization + Organization → MENTIONS;
    /// remaining same-sentence pairs → RELATED_TO.
    pub fn extract_relations(&self, text: &str) -> Vec<ExtractedRelation> {
        let mut relations: Vec<ExtractedRelation> = Vec::new();

        for sentence in split_sentences(text) {
            let entities = self.extract_entities(&sentence);
            if entities.len() < 2 {
                continue;
            }

            // Shorter sentences give stronger co-occurrence evidence.
            let confidence = (0.9 - 0.02 * (sentence.split_whitespace().count() as f64 / 5.0))
                .clamp(0.3, 0.9);

            for i in 0..entities.len() {
                for j in (i + 1)..entities.len() {
                    let (a, b) = (&entities[i], &entities[j]);
                    let (relation_type, src, dst) = match (a.entity_type, b.entity_type) {
                        (EntityType::Organization, EntityType::Metric) => {
                            (RelationType::Reported, a, b)
                        }
                        (EntityType::Metric, EntityType::Organization) => {
                            (RelationType::Reported, b, a)
                        }
                        (EntityType::Organization, EntityType::Regulation) => {
                            (RelationType::GovernedBy, a, b)
                        }
                        (EntityType::Regulation, EntityType::Organization) => {
                            (RelationType::GovernedBy, b, a)
                        }
                        (EntityType::Organization, EntityType::Organization) => {
                            (RelationType::Mentions, a, b)
                        }
                        _ => (RelationType::RelatedTo, a, b),
                    };

                    let duplicate = relations.iter().any(|r| {
                        r.src == src.name && r.dst == dst.name && r.relation_type == relation_type
                    });
                    if !duplicate {
                        relations.push(ExtractedRelation {
                            src: src.name.clone(),
                            src_type: src.entity_type,
                            dst: dst.name.clone(),
                            dst_type: dst.entity_type,
                            relation_type,
                            confidence,
                        });
                    }
                }
            }
        }

        relations
    }
}
