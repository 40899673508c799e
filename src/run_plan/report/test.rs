use super::*;
use crate::core::fixtures::{actual, desired};
use crate::core::plan::Field;
use crate::core::spec::Protocol;
use pretty_assertions::assert_eq;

fn create() -> ReconciliationAction {
    ReconciliationAction::Create(desired("admin", Protocol::Rdp))
}

mod title {
    use super::*;
    use pretty_assertions::assert_eq;
    use ReconciliationAction::*;

    #[test]
    fn create() {
        assert_eq!(
            "create web01-admin-rdp (rdp admin@10.0.0.5:3389)",
            title(&super::create()),
        );
    }

    #[test]
    fn update_lists_fields() {
        assert_eq!(
            "update web01-admin-rdp (host, port, secret)",
            title(&Update {
                existing: actual("c1", "admin", Protocol::Rdp),
                diffs: [Field::Secret, Field::Host, Field::Port].into_iter().collect(),
                spec: desired("admin", Protocol::Rdp),
            }),
        );
    }

    #[test]
    fn recreate() {
        assert_eq!(
            "recreate web01-admin-rdp as web01-admin-vnc (rdp -> vnc)",
            title(&Recreate {
                existing: actual("c1", "admin", Protocol::Rdp),
                diffs: [Field::Protocol].into_iter().collect(),
                spec: desired("admin", Protocol::Vnc),
            }),
        );
    }

    #[test]
    fn orphan_handling() {
        assert_eq!(
            "pull into notes: web01-ops-ssh",
            title(&PullIntoNotes(actual("c1", "ops", Protocol::Ssh))),
        );
        assert_eq!(
            "delete web01-ops-ssh",
            title(&Delete(actual("c1", "ops", Protocol::Ssh))),
        );
    }

    #[test]
    fn never_shows_the_secret() {
        assert!(!title(&super::create()).contains(crate::core::fixtures::SECRET));
    }
}

mod _report {
    use super::*;

    pub mod fixtures {
        use super::*;

        // Runs _report() with fake stdout/stderr.
        pub fn test_report(
            machine: &str,
            action: &ReconciliationAction,
            outcome: Outcome,
        ) -> (io::Result<()>, String, String) {
            let mut stdout = vec![];
            let mut stderr = vec![];
            let result = _report(&mut stdout, &mut stderr, machine, action, &outcome);
            (
                result,
                String::from_utf8(stdout).unwrap(),
                String::from_utf8(stderr).unwrap(),
            )
        }

        // A writer that fails on every write.
        pub struct FailingWriter;

        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("failing as expected"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
    }
    use fixtures::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reports_applied() {
        let (result, stdout, stderr) = test_report("web01", &create(), Outcome::Applied);
        assert!(result.is_ok());
        assert_eq!(
            "[web01] Completed create web01-admin-rdp (rdp admin@10.0.0.5:3389)\n",
            stdout,
        );
        assert!(stderr.is_empty());
    }

    #[test]
    fn reports_skipped_with_reason() {
        let (_, stdout, _) = test_report("web01", &create(), Outcome::Skipped("cancelled".into()));
        assert!(stdout.starts_with("[web01] Skipped   create web01-admin-rdp"));
        assert!(stdout.trim_end().ends_with(": cancelled"));
    }

    #[test]
    fn reports_failure_on_stderr() {
        let (result, stdout, stderr) = test_report(
            "web01",
            &create(),
            Outcome::Failed("broker said no\nreally".into()),
        );

        assert!(result.is_ok());
        assert!(stdout.is_empty());
        assert!(stderr.starts_with("[web01] Action failed. See below for details.\n"));
        assert!(stderr.contains("    Error:\n        broker said no\n        really\n"));
        assert!(stderr.contains("    Action:\n        action: create\n"));
        assert!(!stderr.contains(crate::core::fixtures::SECRET));
    }

    #[test]
    fn returns_error_if_writing_fails() {
        let result = _report(
            &mut FailingWriter,
            &mut Vec::<u8>::new(),
            "web01",
            &create(),
            &Outcome::Applied,
        );
        assert!(result.is_err());

        let result = _report(
            &mut Vec::<u8>::new(),
            &mut FailingWriter,
            "web01",
            &create(),
            &Outcome::Failed("x".into()),
        );
        assert!(result.is_err());
    }
}

mod _starting {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn works() {
        let mut stdout: Vec<u8> = Vec::new();
        let action = create();
        _starting(&mut stdout, "web01", &action).unwrap();
        assert_eq!(
            format!("[web01] Starting  {}\n", title(&action)),
            String::from_utf8_lossy(&stdout),
        );
    }
}
