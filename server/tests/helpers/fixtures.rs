//! Fixture project builders shared by the integration tests.

use super::TestHarness;

/// Three small files under default filtering: the smallest interesting
/// project shape (a root file, a nested file, and a config file).
pub fn basic_project(h: &TestHarness) {
    h.write_file("main.py", "import utils\n\nprint('starting up')\n");
    h.write_file(
        "utils/helper.py",
        "def helper():\n    return 'helping'\n",
    );
    h.write_file("config.json", "{\"name\": \"fixture\", \"debug\": false}\n");
}

/// Two files sharing a literal token on known lines.
pub fn search_project(h: &TestHarness) {
    h.write_file("a.py", "x = 0\nprint(\"hello\")\n");
    h.write_file("b.py", "hello = 1\n");
}
