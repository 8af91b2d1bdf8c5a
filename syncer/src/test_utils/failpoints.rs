use fail::FailScenario;

/// Configures failpoints for the lifetime of the guard and turns them off when dropped.
///
/// Holding the guard also serializes tests relying on failpoints, since they are process global.
pub struct ScopedFailpoints<'a> {
    _scenario: FailScenario<'a>,
    names: Vec<String>,
}

impl<'a> ScopedFailpoints<'a> {
    /// Enables every `(name, action)` pair, see [`fail::cfg`] for the action syntax.
    pub fn enable(failpoints: &[(&str, &str)]) -> ScopedFailpoints<'a> {
        let scenario = FailScenario::setup();

        let mut names = Vec::with_capacity(failpoints.len());
        for (name, action) in failpoints {
            if let Err(err) = fail::cfg(*name, action) {
                panic!("invalid failpoint action `{action}` for `{name}`: {err}");
            }
            names.push((*name).to_owned());
        }

        Self {
            _scenario: scenario,
            names,
        }
    }
}

impl Drop for ScopedFailpoints<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            fail::remove(name);
        }
    }
}
