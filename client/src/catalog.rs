use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Java,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Javascript, Language::Python, Language::Java];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Language::Javascript => "JavaScript",
            Language::Python => "Python",
            Language::Java => "Java",
        }
    }

    /// Editor contents for a language when no problem is selected.
    pub fn boilerplate(&self) -> &'static str {
        match self {
            Language::Javascript => JS_BOILERPLATE,
            Language::Python => PY_BOILERPLATE,
            Language::Java => JAVA_BOILERPLATE,
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::Javascript
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Language::Javascript),
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            other => anyhow::bail!("unsupported language '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Question {
    pub id: String,
    pub title: String,
    pub description: String,
    pub starter_code: HashMap<Language, String>,
}

impl Question {
    /// Starter code for `language`, falling back to the JavaScript template.
    pub fn starter_for(&self, language: Language) -> Option<&str> {
        self.starter_code
            .get(&language)
            .or_else(|| self.starter_code.get(&Language::Javascript))
            .map(String::as_str)
    }
}

/// Static problem lookup. Both participants hold the same catalog, so a
/// question id is all that travels over the channel.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    questions: Vec<Question>,
}

impl Catalog {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            question(
                "two-sum",
                "Two Sum",
                "Given an array of integers nums and an integer target, return indices of the two numbers such that they add up to target.",
                [
                    "// Two Sum\nfunction twoSum(nums, target) {\n  \n}",
                    "# Two Sum\ndef two_sum(nums, target):\n    pass",
                    "// Two Sum\npublic int[] twoSum(int[] nums, int target) {\n    return new int[]{};\n}",
                ],
            ),
            question(
                "palindrome",
                "Valid Palindrome",
                "A phrase is a palindrome if, after converting all uppercase letters into lowercase letters and removing all non-alphanumeric characters, it reads the same forward and backward.",
                [
                    "// Valid Palindrome\nfunction isPalindrome(s) {\n  \n}",
                    "# Valid Palindrome\ndef is_palindrome(s):\n    pass",
                    "// Valid Palindrome\npublic boolean isPalindrome(String s) {\n    return false;\n}",
                ],
            ),
            question(
                "reverse-ll",
                "Reverse Linked List",
                "Given the head of a singly linked list, reverse the list, and return the reversed list.",
                [
                    "// Reverse Linked List\nfunction reverseList(head) {\n  \n}",
                    "# Reverse Linked List\ndef reverse_list(head):\n    pass",
                    "// Reverse Linked List\npublic ListNode reverseList(ListNode head) {\n    return null;\n}",
                ],
            ),
        ])
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn find(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn first(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// Code a participant starts from after switching to `language`.
    pub fn starter_code(&self, question_id: Option<&str>, language: Language) -> String {
        question_id
            .and_then(|id| self.find(id))
            .and_then(|q| q.starter_code.get(&language))
            .cloned()
            .unwrap_or_else(|| language.boilerplate().to_string())
    }
}

fn question(id: &str, title: &str, description: &str, starters: [&str; 3]) -> Question {
    let starter_code = Language::ALL
        .iter()
        .copied()
        .zip(starters.iter().map(|s| s.to_string()))
        .collect();
    Question {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        starter_code,
    }
}

const JS_BOILERPLATE: &str = "// Welcome to the technical interview.
// Given an array of integers nums and an integer target,
// return indices of the two numbers such that they add up to target.

function twoSum(nums, target) {
  // Your code here

}

console.log(twoSum([2, 7, 11, 15], 9));
";

const PY_BOILERPLATE: &str = "# Welcome to the technical interview.
# Given an array of integers nums and an integer target,
# return indices of the two numbers such that they add up to target.

def two_sum(nums, target):
    # Your code here
    pass

print(two_sum([2, 7, 11, 15], 9))
";

const JAVA_BOILERPLATE: &str = "// Welcome to the technical interview.
// Given an array of integers nums and an integer target,
// return indices of the two numbers such that they add up to target.

import java.util.*;

public class Main {
    public static int[] twoSum(int[] nums, int target) {
        // Your code here
        return new int[]{};
    }

    public static void main(String[] args) {
        int[] result = twoSum(new int[]{2, 7, 11, 15}, 9);
        System.out.println(Arrays.toString(result));
    }
}
";
