use crate::gateway::BackendReport;

impl BackendReport {
    /// Markdown table for the `backends` tool.
    pub fn to_markdown(&self) -> String {
        let busy = match (self.active_request_id, self.active_for_ms) {
            (Some(id), Some(ms)) => format!("yes (request #{id}, running for {ms}ms)"),
            (Some(id), None) => format!("yes (request #{id})"),
            _ if self.busy => "yes".to_string(),
            _ => "no".to_string(),
        };
        let mut out = format!(
            "Preference: {}\nLocal token ceiling: {}\nBusy: {busy}\n\n| tier | configured | available |\n|---|---|---|\n",
            self.preference.as_str(),
            self.local_token_ceiling,
        );
        for b in &self.backends {
            let available = match b.available {
                Some(true) => "yes",
                Some(false) => "no",
                None => "not probed",
            };
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                b.tier,
                if b.configured { "yes" } else { "no" },
                available
            ));
        }
        out
    }
}
