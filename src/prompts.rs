//! System-prompt templates for the two conversation modes
//!
//! Templates carry `{placeholder}` slots filled from the session's context
//! variables. Both instruct the model to answer in segment form
//! (`[S]speech[/S]` with an optional `[B]board[/B]` block) so the pipeline
//! can speak each utterance while the tablet renders the board markup.

use std::collections::HashMap;

use crate::types::ConversationKind;

/// Shared output-format contract appended to both templates
const SEGMENT_FORMAT_RULES: &str = r#"## 输出格式（必须严格遵守）
你的每条回复由若干「段」组成，每段包含一句要朗读的话，以及可选的板书：
- 朗读内容写在 [S] 和 [/S] 之间，口语化、适合朗读，不要出现任何格式符号
- 需要板书时，紧跟 [B] 和 [/B]，内容用板书标记语言书写
- 每段朗读不超过两句话；一条回复一般 1～4 段

板书标记语言：
- 步骤块：:::step{n=1} 标题 ... :::
- 提示块：:::note{color=blue|yellow|green} ... :::
- 答案块：:::answer ... :::
- 行内强调：==黄色高亮==、^^红色^^、**加粗红**、__下划线__

示例：
[S]我们先看第一步，把两边同时减三。[/S][B]:::step{n=1} 移项
x + 3 - 3 = 7 - 3
:::[/B][S]这样就得到x等于四啦。[/S]"#;

/// Guided problem-solving / tutoring mode
const TUTORING_PROMPT: &str = r#"你是一位耐心、专业的AI学习助手老师，正在帮助学生{student_name}解答问题。

## 学生信息
- 姓名：{student_name}
- 年级：{grade}
- 当前学科：{subject}

## 题目信息
{question_context}

## 教学原则
1. 引导式教学：不直接给出答案，而是通过提问和引导帮助学生理解
2. 循序渐进：将复杂问题分解成小步骤，逐步引导
3. 鼓励思考：鼓励学生尝试，即使答错也要给予正面反馈
4. 通俗易懂：用学生能理解的语言解释概念
5. 板书辅助：关键步骤、公式和结论写到板书上，朗读保持简短

## 回复风格
- 语气亲切、有耐心，像一位关心学生的老师
- 朗读部分简洁明了（每段不超过两句话）
- 适当使用语气词让对话更自然（如"嗯"、"好的"、"让我想想"）

请用中文回复，语气要温和友好。"#;

/// Open teacher-chat mode
const CHAT_PROMPT: &str = r#"你是一位友好、博学的AI老师小智，正在和学生{student_name}聊天。

## 学生信息
- 姓名：{student_name}
- 年级：{grade}

## 角色设定
你是一位：
- 知识渊博但不炫耀的老师
- 善于倾听、理解学生的朋友
- 有趣、有活力的交流伙伴

## 回复风格
- 语气亲切自然，像朋友一样聊天
- 朗读部分简洁有趣（每段不超过两句话）
- 讲解知识点时可以配合板书列出要点
- 保持积极正面的态度

## 注意事项
- 如果涉及不适合未成年人的话题，委婉转移话题
- 鼓励学生多学习、多思考

请用中文回复，语气要轻松友好。"#;

/// Render the system prompt for a conversation mode.
///
/// Missing variables fall back to neutral defaults so a sparsely seeded
/// session still renders a usable prompt.
pub fn render_prompt(kind: ConversationKind, vars: &HashMap<String, String>) -> String {
    let template = match kind {
        ConversationKind::Tutoring => TUTORING_PROMPT,
        ConversationKind::Chat => CHAT_PROMPT,
    };

    let defaults: [(&str, &str); 4] = [
        ("student_name", "同学"),
        ("grade", "初中"),
        ("subject", "未知"),
        ("question_context", "暂无题目信息"),
    ];

    let mut prompt = template.to_string();
    for (key, default) in defaults {
        let value = vars.get(key).map(String::as_str).filter(|v| !v.is_empty()).unwrap_or(default);
        prompt = prompt.replace(&format!("{{{}}}", key), value);
    }

    format!("{}\n\n{}", prompt, SEGMENT_FORMAT_RULES)
}

/// Assemble the `question_context` variable from the seeded question fields.
pub fn build_question_context(vars: &HashMap<String, String>) -> String {
    let mut parts = Vec::new();
    let labeled = [
        ("context_text", "题目内容"),
        ("context_image_url", "题目图片"),
        ("user_answer", "学生答案"),
        ("correct_answer", "参考答案"),
    ];
    for (key, label) in labeled {
        if let Some(value) = vars.get(key).filter(|v| !v.is_empty()) {
            parts.push(format!("{}：{}", label, value));
        }
    }
    if parts.is_empty() {
        "学生正在向你请教问题".to_string()
    } else {
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_vars() {
        let vars = HashMap::from([
            ("student_name".to_string(), "小明".to_string()),
            ("grade".to_string(), "五年级".to_string()),
        ]);
        let prompt = render_prompt(ConversationKind::Chat, &vars);
        assert!(prompt.contains("小明"));
        assert!(prompt.contains("五年级"));
        assert!(!prompt.contains("{student_name}"));
        // Every rendered prompt carries the segment-format contract
        assert!(prompt.contains("[S]"));
        assert!(prompt.contains(":::step"));
    }

    #[test]
    fn test_render_uses_defaults() {
        let prompt = render_prompt(ConversationKind::Tutoring, &HashMap::new());
        assert!(prompt.contains("同学"));
        assert!(prompt.contains("暂无题目信息"));
    }

    #[test]
    fn test_question_context_assembly() {
        let vars = HashMap::from([
            ("context_text".to_string(), "求x".to_string()),
            ("user_answer".to_string(), "x=3".to_string()),
        ]);
        let ctx = build_question_context(&vars);
        assert_eq!(ctx, "题目内容：求x\n学生答案：x=3");

        assert_eq!(build_question_context(&HashMap::new()), "学生正在向你请教问题");
    }
}
