//! Interactive card payloads
//!
//! Cards use the platform's schema 2.0 form layout. Field names here must
//! match [`insight_common::config::form_fields`], which the event
//! normalizer uses to read submissions back.

use insight_common::config::form_fields;
use serde_json::{json, Value};

/// The task configuration form: source table link, task name, optional
/// destination folder, and a submit button.
#[must_use]
pub fn config_card() -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "template": "blue",
            "title": { "tag": "plain_text", "content": "🎬 视频洞察分析 - 任务配置" }
        },
        "body": {
            "elements": [
                {
                    "tag": "div",
                    "text": {
                        "tag": "plain_text",
                        "content": "请填写源数据表格链接和任务名称，点击按钮开始分析。"
                    }
                },
                {
                    "tag": "form",
                    "name": "video_analysis_task_submit",
                    "elements": [
                        {
                            "tag": "input",
                            "name": form_fields::SOURCE_LINK,
                            "label": { "tag": "plain_text", "content": "源数据表链接" },
                            "placeholder": { "tag": "plain_text", "content": "多维表格链接（支持 Base 和 Wiki）" },
                            "required": true
                        },
                        {
                            "tag": "input",
                            "name": form_fields::TASK_NAME,
                            "label": { "tag": "plain_text", "content": "新任务名称" },
                            "placeholder": { "tag": "plain_text", "content": "请输入任务名称" },
                            "required": true,
                            "default_value": "视频分析任务"
                        },
                        {
                            "tag": "input",
                            "name": form_fields::FOLDER_TOKEN,
                            "label": { "tag": "plain_text", "content": "目标文件夹 Token (可选)" },
                            "placeholder": { "tag": "plain_text", "content": "可选" }
                        },
                        {
                            "tag": "button",
                            "name": "submit_btn",
                            "text": { "tag": "plain_text", "content": "确认提交" },
                            "type": "primary",
                            "action_type": "form_submit"
                        }
                    ]
                }
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_declares_all_form_fields() {
        let card = config_card();
        let rendered = card.to_string();
        assert!(rendered.contains(form_fields::SOURCE_LINK));
        assert!(rendered.contains(form_fields::TASK_NAME));
        assert!(rendered.contains(form_fields::FOLDER_TOKEN));
        assert!(rendered.contains("submit_btn"));
        assert_eq!(card["schema"], "2.0");
    }
}
