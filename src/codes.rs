//! Thesis and defence codes are derived from their parent, never supplied.

pub const THESIS_PREFIX: &str = "TG";
pub const DEFENCE_PREFIX: &str = "DF";

pub fn thesis_code(proposal_code: &str) -> String {
    format!("{THESIS_PREFIX}{proposal_code}")
}

pub fn defence_code(thesis_code: &str) -> String {
    format!("{DEFENCE_PREFIX}{thesis_code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thesis_code_is_stable() {
        assert_eq!(thesis_code("P100"), "TGP100");
        assert_eq!(thesis_code("P100"), thesis_code("P100"));
    }

    #[test]
    fn defence_code_chains_from_thesis() {
        assert_eq!(defence_code(&thesis_code("P100")), "DFTGP100");
    }
}
