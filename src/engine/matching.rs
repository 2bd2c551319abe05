//! Fuzzy entity matching for team and participant names.
//!
//! The same fixture arrives under different spellings depending on the feed:
//! a bookmaker says "Los Angeles Lakers", a prediction-market question says
//! "Will the Lakers beat the Celtics?", a results feed says "LA Lakers".
//! Matching is alias resolution + normalization + token-set similarity, with
//! substring and prefix escape hatches for prose questions.

use std::collections::HashSet;

/// Common abbreviations and nicknames → canonical names.
/// Keyed by the *normalized* short form.
static ALIASES: &[(&str, &str)] = &[
    // NBA
    ("lakers", "Los Angeles Lakers"),
    ("la lakers", "Los Angeles Lakers"),
    ("clippers", "LA Clippers"),
    ("warriors", "Golden State Warriors"),
    ("celtics", "Boston Celtics"),
    ("heat", "Miami Heat"),
    ("nets", "Brooklyn Nets"),
    ("bulls", "Chicago Bulls"),
    ("sa spurs", "San Antonio Spurs"),
    ("kings", "Sacramento Kings"),
    ("nuggets", "Denver Nuggets"),
    ("suns", "Phoenix Suns"),
    ("bucks", "Milwaukee Bucks"),
    ("sixers", "Philadelphia 76ers"),
    ("76ers", "Philadelphia 76ers"),
    ("knicks", "New York Knicks"),
    ("mavs", "Dallas Mavericks"),
    ("rockets", "Houston Rockets"),
    ("raptors", "Toronto Raptors"),
    // MLB
    ("yankees", "New York Yankees"),
    ("red sox", "Boston Red Sox"),
    ("dodgers", "Los Angeles Dodgers"),
    ("cubs", "Chicago Cubs"),
    ("astros", "Houston Astros"),
    // Esports
    ("navi", "Natus Vincere"),
    ("faze", "FaZe Clan"),
    ("g2", "G2 Esports"),
    ("liquid", "Team Liquid"),
    ("secret", "Team Secret"),
    // Soccer: EPL
    ("man utd", "Manchester United"),
    ("man united", "Manchester United"),
    ("mufc", "Manchester United"),
    ("man city", "Manchester City"),
    ("mcfc", "Manchester City"),
    ("gunners", "Arsenal"),
    ("afc", "Arsenal"),
    ("lfc", "Liverpool"),
    ("cfc", "Chelsea"),
    ("spurs", "Tottenham Hotspur"),
    ("tottenham", "Tottenham Hotspur"),
    ("thfc", "Tottenham Hotspur"),
    ("newcastle", "Newcastle United"),
    ("nufc", "Newcastle United"),
    ("villa", "Aston Villa"),
    ("avfc", "Aston Villa"),
    ("west ham", "West Ham United"),
    ("hammers", "West Ham United"),
    ("toffees", "Everton"),
    // Soccer: La Liga / Bundesliga / UCL
    ("barca", "FC Barcelona"),
    ("barcelona", "FC Barcelona"),
    ("fcb", "FC Barcelona"),
    ("real", "Real Madrid"),
    ("rmcf", "Real Madrid"),
    ("atletico", "Atletico Madrid"),
    ("atleti", "Atletico Madrid"),
    ("bayern", "Bayern Munich"),
    ("dortmund", "Borussia Dortmund"),
    ("bvb", "Borussia Dortmund"),
    ("psg", "Paris Saint-Germain"),
    ("juve", "Juventus"),
    ("inter", "Inter Milan"),
    ("internazionale", "Inter Milan"),
    ("milan", "AC Milan"),
    // NFL
    ("chiefs", "Kansas City Chiefs"),
    ("kc", "Kansas City Chiefs"),
    ("eagles", "Philadelphia Eagles"),
    ("philly", "Philadelphia Eagles"),
    ("49ers", "San Francisco 49ers"),
    ("niners", "San Francisco 49ers"),
    ("bills", "Buffalo Bills"),
    ("cowboys", "Dallas Cowboys"),
    ("ravens", "Baltimore Ravens"),
    ("packers", "Green Bay Packers"),
    ("lions", "Detroit Lions"),
    ("dolphins", "Miami Dolphins"),
    ("bengals", "Cincinnati Bengals"),
    ("rams", "Los Angeles Rams"),
    ("chargers", "Los Angeles Chargers"),
    ("steelers", "Pittsburgh Steelers"),
    ("bears", "Chicago Bears"),
    ("patriots", "New England Patriots"),
    ("commanders", "Washington Commanders"),
    ("giants", "New York Giants"),
    ("jets", "New York Jets"),
    ("texans", "Houston Texans"),
    ("broncos", "Denver Broncos"),
    ("seahawks", "Seattle Seahawks"),
    ("vikings", "Minnesota Vikings"),
    ("saints", "New Orleans Saints"),
];

/// Tokens that carry no entity identity and would inflate Jaccard overlap.
const STOP_WORDS: &[&str] = &[
    "the", "fc", "cf", "sc", "ac", "de", "city", "united", "of", "and",
];

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize(name: &str) -> String {
    let stripped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve_alias(name: &str) -> String {
    let norm = normalize(name);
    ALIASES
        .iter()
        .find(|(short, _)| *short == norm)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn token_set(normalized: &str) -> HashSet<&str> {
    normalized
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .collect()
}

/// Symmetric fuzzy comparison of two participant names.
///
/// Returns true when the Jaccard similarity of stop-word-filtered token sets
/// reaches `threshold`, when one normalized string contains the other, or
/// when both share their first five characters. The substring rule is what
/// lets a short team name land inside a full prose market question.
pub fn fuzzy_match(a: &str, b: &str, threshold: f64) -> bool {
    let na = normalize(&resolve_alias(a));
    let nb = normalize(&resolve_alias(b));
    if na == nb {
        return true;
    }
    let ta = token_set(&na);
    let tb = token_set(&nb);
    if ta.is_empty() || tb.is_empty() {
        return false;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    let jaccard = intersection as f64 / union as f64;

    if jaccard >= threshold || na.contains(&nb) || nb.contains(&na) {
        return true;
    }
    // Shared 5-char prefix on two reasonably long names (char-wise, so
    // multi-byte names can't split a boundary)
    let pa: Vec<char> = na.chars().collect();
    let pb: Vec<char> = nb.chars().collect();
    pa.len() >= 5 && pb.len() >= 5 && pa[..5] == pb[..5]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(fuzzy_match("Arsenal", "Arsenal", 0.6));
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        assert!(fuzzy_match("St. Louis Cardinals", "st louis cardinals", 0.6));
    }

    #[test]
    fn test_alias_resolution() {
        // "Lakers" resolves to "Los Angeles Lakers" via the alias table
        assert!(fuzzy_match("Lakers", "Los Angeles Lakers", 0.5));
        assert!(fuzzy_match("Man Utd", "Manchester United", 0.5));
    }

    #[test]
    fn test_substring_rule_for_market_questions() {
        assert!(fuzzy_match(
            "Arsenal",
            "Will Arsenal win the Premier League match?",
            0.3
        ));
    }

    #[test]
    fn test_prefix_rule() {
        // Shared 5-char prefix is enough when both names are long
        assert!(fuzzy_match("Barcelona B", "Barcelona Atletic", 0.9));
    }

    #[test]
    fn test_unrelated_names_reject() {
        assert!(!fuzzy_match("Boston Celtics", "Miami Heat", 0.5));
        assert!(!fuzzy_match("Real Madrid", "Bayern Munich", 0.5));
    }

    #[test]
    fn test_symmetry() {
        let pairs = [
            ("Lakers", "Los Angeles Lakers"),
            ("Arsenal", "Will Arsenal win?"),
            ("Bayern Munich", "Borussia Dortmund"),
            ("", "Chelsea"),
        ];
        for (a, b) in pairs {
            for th in [0.3, 0.5, 0.6, 0.8] {
                assert_eq!(
                    fuzzy_match(a, b, th),
                    fuzzy_match(b, a, th),
                    "asymmetric for ({a:?}, {b:?}) at {th}"
                );
            }
        }
    }

    #[test]
    fn test_stop_words_do_not_link() {
        // Overlap only through stop words must not count as similarity
        assert!(!fuzzy_match("FC United of the City", "AC City United", 0.3));
    }

    #[test]
    fn test_empty_input() {
        assert!(!fuzzy_match("", "Arsenal", 0.3));
        assert!(fuzzy_match("", "", 0.3)); // both normalize to equal empties
    }
}
