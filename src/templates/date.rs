//! Locale-aware long date formatting for the `${date}` template placeholder.
//!
//! Pure lookup on an injected name table; no process-wide locale state.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};

use super::model::DEFAULT_LANGUAGE;

/// Weekday (Monday first) and month names for one language.
#[derive(Debug, Clone)]
pub struct DateNames {
    pub weekdays: [&'static str; 7],
    pub months: [&'static str; 12],
}

/// Language code → date names. Unknown languages use English.
#[derive(Debug, Clone)]
pub struct DateFormatTable {
    names: HashMap<String, DateNames>,
}

impl DateFormatTable {
    /// An empty table; every language formats with the English fallback.
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
        }
    }

    /// Register (or replace) the names for a language.
    pub fn insert(&mut self, language: &str, names: DateNames) {
        self.names.insert(language.to_lowercase(), names);
    }

    /// Names for a language, falling back to English.
    pub fn names(&self, language: &str) -> &DateNames {
        self.names
            .get(&language.to_lowercase())
            .or_else(|| self.names.get(DEFAULT_LANGUAGE))
            .unwrap_or(&ENGLISH)
    }
}

impl Default for DateFormatTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert("en", ENGLISH);
        table.insert(
            "fr",
            DateNames {
                weekdays: ["lundi", "mardi", "mercredi", "jeudi", "vendredi", "samedi", "dimanche"],
                months: [
                    "janvier", "février", "mars", "avril", "mai", "juin", "juillet", "août",
                    "septembre", "octobre", "novembre", "décembre",
                ],
            },
        );
        table.insert(
            "de",
            DateNames {
                weekdays: [
                    "Montag", "Dienstag", "Mittwoch", "Donnerstag", "Freitag", "Samstag", "Sonntag",
                ],
                months: [
                    "Januar", "Februar", "März", "April", "Mai", "Juni", "Juli", "August",
                    "September", "Oktober", "November", "Dezember",
                ],
            },
        );
        table.insert(
            "es",
            DateNames {
                weekdays: ["lunes", "martes", "miércoles", "jueves", "viernes", "sábado", "domingo"],
                months: [
                    "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto",
                    "septiembre", "octubre", "noviembre", "diciembre",
                ],
            },
        );
        table.insert(
            "it",
            DateNames {
                weekdays: [
                    "lunedì", "martedì", "mercoledì", "giovedì", "venerdì", "sabato", "domenica",
                ],
                months: [
                    "gennaio", "febbraio", "marzo", "aprile", "maggio", "giugno", "luglio",
                    "agosto", "settembre", "ottobre", "novembre", "dicembre",
                ],
            },
        );
        table.insert(
            "nl",
            DateNames {
                weekdays: [
                    "maandag", "dinsdag", "woensdag", "donderdag", "vrijdag", "zaterdag", "zondag",
                ],
                months: [
                    "januari", "februari", "maart", "april", "mei", "juni", "juli", "augustus",
                    "september", "oktober", "november", "december",
                ],
            },
        );
        table.insert(
            "pt",
            DateNames {
                weekdays: [
                    "segunda-feira", "terça-feira", "quarta-feira", "quinta-feira", "sexta-feira",
                    "sábado", "domingo",
                ],
                months: [
                    "janeiro", "fevereiro", "março", "abril", "maio", "junho", "julho", "agosto",
                    "setembro", "outubro", "novembro", "dezembro",
                ],
            },
        );
        table
    }
}

const ENGLISH: DateNames = DateNames {
    weekdays: [
        "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
    ],
    months: [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ],
};

/// Format `date` as `<weekday> <day> <month> <year>` in the given language.
pub fn format_long_date(table: &DateFormatTable, language: &str, date: NaiveDate) -> String {
    let names = table.names(language);
    let weekday = names.weekdays[date.weekday().num_days_from_monday() as usize];
    let month = names.months[date.month0() as usize];
    format!("{weekday} {} {month} {}", date.day(), date.year())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    #[test]
    fn formats_english() {
        let table = DateFormatTable::default();
        assert_eq!(format_long_date(&table, "en", date()), "Friday 16 October 2026");
    }

    #[test]
    fn formats_french_and_german() {
        let table = DateFormatTable::default();
        assert_eq!(format_long_date(&table, "fr", date()), "vendredi 16 octobre 2026");
        assert_eq!(format_long_date(&table, "DE", date()), "Freitag 16 Oktober 2026");
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let table = DateFormatTable::default();
        assert_eq!(format_long_date(&table, "ja", date()), "Friday 16 October 2026");
    }

    #[test]
    fn empty_table_still_formats() {
        let table = DateFormatTable::empty();
        assert_eq!(
            format_long_date(&table, "fr", NaiveDate::from_ymd_opt(2027, 1, 4).unwrap()),
            "Monday 4 January 2027"
        );
    }

    #[test]
    fn injected_names_override_defaults() {
        let mut table = DateFormatTable::empty();
        table.insert(
            "xx",
            DateNames {
                weekdays: ["d1", "d2", "d3", "d4", "d5", "d6", "d7"],
                months: ["m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9", "m10", "m11", "m12"],
            },
        );
        assert_eq!(format_long_date(&table, "xx", date()), "d5 16 m10 2026");
    }
}
