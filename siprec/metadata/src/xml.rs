//! XML serialisation of the metadata document (`application/rs-metadata+xml`).

use crate::{Participant, RecordingMetadata};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use std::io::Cursor;

const NAMESPACE: &str = "urn:ietf:params:xml:ns:recording:1";

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("failed to write metadata XML, {0}")]
    Write(#[from] quick_xml::Error),
    #[error("metadata XML is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

impl RecordingMetadata {
    /// Serialise the document as an RFC 7865 recording element.
    pub fn to_xml(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut recording = BytesStart::new("recording");
        recording.push_attribute(("xmlns", NAMESPACE));
        writer.write_event(Event::Start(recording))?;

        write_text_element(&mut writer, "datamode", crate::DATAMODE)?;

        let mut group = BytesStart::new("group");
        group.push_attribute(("group_id", self.group_id().as_str()));
        writer.write_event(Event::Empty(group))?;

        let mut session = BytesStart::new("session");
        session.push_attribute(("session_id", self.session_id().as_str()));
        writer.write_event(Event::Start(session))?;
        write_text_element(&mut writer, "sipSessionID", self.sip_session_id())?;
        write_text_element(&mut writer, "group-ref", self.group_id().as_str())?;
        writer.write_event(Event::End(BytesStart::new("session").to_end()))?;

        for participant in self.participants() {
            write_participant(&mut writer, participant)?;
        }

        for stream in self.streams() {
            let mut elem = BytesStart::new("stream");
            elem.push_attribute(("stream_id", stream.id().as_str()));
            elem.push_attribute(("session_id", self.session_id().as_str()));
            writer.write_event(Event::Start(elem))?;
            write_text_element(&mut writer, "label", &stream.label().to_string())?;
            writer.write_event(Event::End(BytesStart::new("stream").to_end()))?;
        }

        let mut assoc = BytesStart::new("sessionrecordingassoc");
        assoc.push_attribute(("session_id", self.session_id().as_str()));
        writer.write_event(Event::Empty(assoc))?;

        for participant in self.participants() {
            let mut elem = BytesStart::new("participantsessionassoc");
            elem.push_attribute(("participant_id", participant.id().as_str()));
            elem.push_attribute(("session_id", self.session_id().as_str()));
            writer.write_event(Event::Empty(elem))?;
        }

        for participant in self.participants() {
            write_stream_assoc(&mut writer, participant)?;
        }

        writer.write_event(Event::End(BytesStart::new("recording").to_end()))?;

        Ok(String::from_utf8(writer.into_inner().into_inner())?)
    }
}

fn write_participant(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    participant: &Participant,
) -> Result<(), XmlError> {
    let mut elem = BytesStart::new("participant");
    elem.push_attribute(("participant_id", participant.id().as_str()));
    writer.write_event(Event::Start(elem))?;

    let mut name_id = BytesStart::new("nameID");
    name_id.push_attribute(("aor", participant.aor()));
    writer.write_event(Event::Start(name_id))?;
    write_text_element(writer, "name", participant.name())?;
    writer.write_event(Event::End(BytesStart::new("nameID").to_end()))?;

    writer.write_event(Event::End(BytesStart::new("participant").to_end()))?;

    Ok(())
}

fn write_stream_assoc(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    participant: &Participant,
) -> Result<(), XmlError> {
    let mut elem = BytesStart::new("participantstreamassoc");
    elem.push_attribute(("participant_id", participant.id().as_str()));
    writer.write_event(Event::Start(elem))?;

    for id in participant.send() {
        write_text_element(writer, "send", id.as_str())?;
    }

    for id in participant.recv() {
        write_text_element(writer, "recv", id.as_str())?;
    }

    writer.write_event(Event::End(BytesStart::new("participantstreamassoc").to_end()))?;

    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<(), XmlError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesStart::new(name).to_end()))?;

    Ok(())
}
